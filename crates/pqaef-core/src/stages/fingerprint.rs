//! `fingerprint`: stamp each record with the SHA-256 of the canonical JSON of one of
//! its fields (or of the whole record), so identical content hashes identically
//! regardless of key order.
//!
//! Parameters: `source_field` (optional, whole record when absent), `target_field`
//! (default `hash`), `error_field` (default `error`).

use super::DEFAULT_ERROR_FIELD;
use crate::canonical;
use crate::errors::{ItemError, PipelineError, PipelineResult};
use crate::model::Dataset;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

pub const KIND: &str = "fingerprint";
pub const DEFAULT_TARGET_FIELD: &str = "hash";

#[derive(Debug)]
pub struct FingerprintStage {
    source_field: Option<String>,
    target_field: String,
    error_field: String,
    missing: usize,
}

impl FingerprintStage {
    pub fn from_context(ctx: &StageContext) -> PipelineResult<Self> {
        Ok(Self {
            source_field: ctx.str_param("source_field")?.map(str::to_string),
            target_field: ctx
                .str_param("target_field")?
                .unwrap_or(DEFAULT_TARGET_FIELD)
                .to_string(),
            error_field: ctx
                .str_param("error_field")?
                .unwrap_or(DEFAULT_ERROR_FIELD)
                .to_string(),
            missing: 0,
        })
    }
}

#[async_trait]
impl Stage for FingerprintStage {
    async fn run(&mut self, mut data: Dataset) -> PipelineResult<Dataset> {
        let mut missing = 0usize;
        for i in 0..data.len() {
            let Some(record) = data.record_mut(i) else {
                continue;
            };
            let digest = match &self.source_field {
                Some(field) => match record.get(field) {
                    Some(v) => Some(canonical::sha256_hex(v)),
                    None => None,
                },
                None => {
                    // Hash the record as it came in, not including a previous stamp.
                    let mut body = record.clone();
                    body.remove(&self.target_field);
                    Some(canonical::sha256_hex(&body))
                }
            };
            match digest {
                Some(hash) => {
                    let hash = hash.map_err(PipelineError::execution)?;
                    record.insert(self.target_field.clone(), Value::String(hash));
                }
                None => {
                    missing += 1;
                    let err = ItemError::malformed(format!(
                        "record has no '{}' field to fingerprint",
                        self.source_field.as_deref().unwrap_or_default()
                    ));
                    let tagged = serde_json::to_value(&err).map_err(PipelineError::execution)?;
                    record.insert(self.error_field.clone(), tagged);
                }
            }
        }
        debug!(stage = KIND, records = data.len(), missing, "fingerprints written");
        self.missing += missing;
        Ok(data)
    }

    fn item_failures(&self) -> usize {
        self.missing
    }
}

pub fn build(ctx: StageContext) -> PipelineResult<Box<dyn Stage>> {
    Ok(Box::new(FingerprintStage::from_context(&ctx)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamMap;
    use serde_json::json;

    fn stage(params: Value) -> FingerprintStage {
        let ctx = StageContext::new(0, KIND, params.as_object().cloned().unwrap_or_default());
        FingerprintStage::from_context(&ctx).unwrap()
    }

    #[tokio::test]
    async fn same_content_same_hash_regardless_of_key_order() {
        let a = json!({"dialogues": {"q": "hi", "a": "hello"}, "id": 1});
        let b = json!({"id": 2, "dialogues": {"a": "hello", "q": "hi"}});
        let data = Dataset::from_records([
            a.as_object().cloned().unwrap(),
            b.as_object().cloned().unwrap(),
        ]);
        let out = stage(json!({"source_field": "dialogues"}))
            .run(data)
            .await
            .unwrap();
        let h0 = out.get(0).unwrap()["hash"].as_str().unwrap().to_string();
        assert_eq!(h0.len(), 64);
        assert_eq!(out.get(1).unwrap()["hash"], json!(h0));
    }

    #[tokio::test]
    async fn missing_source_field_is_tagged_not_fatal() {
        let present = json!({"dialogues": "hi"}).as_object().cloned().unwrap();
        let data = Dataset::from_records([ParamMap::new(), present]);
        let mut s = stage(json!({"source_field": "dialogues", "target_field": "fp"}));
        let out = s.run(data).await.unwrap();
        let rec = out.get(0).unwrap();
        assert!(rec.get("fp").is_none());
        assert_eq!(rec["error"]["kind"], json!("malformed_record"));
        assert!(out.get(1).unwrap().get("fp").is_some());
        assert_eq!(s.item_failures(), 1);
    }

    #[tokio::test]
    async fn whole_record_hash_is_stable_across_reruns() {
        let data = Dataset::from_records([json!({"x": 1}).as_object().cloned().unwrap()]);
        let mut s = stage(json!({}));
        let once = s.run(data).await.unwrap();
        let first = once.get(0).unwrap()["hash"].clone();
        let twice = s.run(once).await.unwrap();
        assert_eq!(twice.get(0).unwrap()["hash"], first);
    }
}
