//! `generate`: render a prompt per record, send it through the `llm` provider and
//! write the completion (or the tagged item error) back into the record.
//!
//! Parameters:
//! - `template` (required): prompt text with `{field}` placeholders; `{{` / `}}` escape braces.
//! - `output_field` (default `generated`), `error_field` (default `error`).
//! - `generation`: stage-level generation params, layered over the provider's defaults.
//! - `overrides_field`: record field holding a map of per-record overrides (wins over both).
//! - `max_error_rate`: fail the stage when the share of transport failures exceeds it.

use super::DEFAULT_ERROR_FIELD;
use crate::cancel::CancelToken;
use crate::errors::{ItemError, ItemErrorKind, PipelineError, PipelineResult};
use crate::model::{merge_params, payload, Dataset, ParamMap, Payload, Record};
use crate::providers::ProviderHandle;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub const KIND: &str = "generate";
pub const LLM_SLOT: &str = "llm";
pub const SLOTS: &[&str] = &[LLM_SLOT];
pub const DEFAULT_OUTPUT_FIELD: &str = "generated";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

/// Parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => return Err(format!("unterminated placeholder '{{{}'", name)),
                        }
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err("empty placeholder '{}'".to_string());
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Field(name.to_string()));
                }
                '}' => return Err("unmatched '}'".to_string()),
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Self { segments })
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(f) => Some(f.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Strings are inserted as-is, other values as compact JSON.
    pub fn render(&self, record: &Record) -> Result<String, String> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Field(f) => match record.get(f) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {
                        return Err(format!("record has no value for '{}'", f))
                    }
                    Some(other) => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(out)
    }
}

pub struct GenerateStage {
    index: usize,
    llm: Arc<ProviderHandle>,
    template: Template,
    generation: ParamMap,
    overrides_field: Option<String>,
    output_field: String,
    error_field: String,
    max_error_rate: Option<f64>,
    cancel: CancelToken,
    rejected: usize,
}

impl std::fmt::Debug for GenerateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateStage")
            .field("index", &self.index)
            .field("llm", &self.llm.name())
            .field("output_field", &self.output_field)
            .finish_non_exhaustive()
    }
}

impl GenerateStage {
    pub fn from_context(ctx: StageContext) -> PipelineResult<Self> {
        let template = Template::parse(ctx.required_str("template")?).map_err(|e| {
            PipelineError::config(format!("stage '{}': invalid template: {}", KIND, e))
        })?;
        let max_error_rate = ctx.f64_param("max_error_rate")?;
        if let Some(rate) = max_error_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(PipelineError::config(format!(
                    "stage '{}': max_error_rate must be within [0, 1], got {}",
                    KIND, rate
                )));
            }
        }

        Ok(Self {
            index: ctx.index,
            llm: ctx.providers.require(LLM_SLOT)?,
            template,
            generation: ctx.object_param("generation")?.cloned().unwrap_or_default(),
            overrides_field: ctx.str_param("overrides_field")?.map(str::to_string),
            output_field: ctx
                .str_param("output_field")?
                .unwrap_or(DEFAULT_OUTPUT_FIELD)
                .to_string(),
            error_field: ctx
                .str_param("error_field")?
                .unwrap_or(DEFAULT_ERROR_FIELD)
                .to_string(),
            max_error_rate,
            cancel: ctx.cancel,
            rejected: 0,
        })
    }

    /// Request payload for one record: stage generation params, then the record's
    /// own overrides, then the prompt.
    fn payload_for(&self, record: &Record) -> Result<Payload, String> {
        let prompt = self.template.render(record)?;
        let overrides = match &self.overrides_field {
            Some(field) => match record.get(field) {
                None | Some(Value::Null) => self.generation.clone(),
                Some(Value::Object(m)) => merge_params(&self.generation, m),
                Some(_) => return Err(format!("'{}' must be a map of overrides", field)),
            },
            None => self.generation.clone(),
        };
        Ok(payload(prompt, &overrides))
    }
}

#[async_trait]
impl Stage for GenerateStage {
    async fn run(&mut self, mut data: Dataset) -> PipelineResult<Dataset> {
        let total = data.len();
        let mut positions = Vec::with_capacity(total);
        let mut payloads = Vec::with_capacity(total);
        let mut outcomes: Vec<(usize, Result<String, ItemError>)> = Vec::with_capacity(total);

        for (i, record) in data.iter().enumerate() {
            match self.payload_for(record) {
                Ok(p) => {
                    positions.push(i);
                    payloads.push(p);
                }
                Err(reason) => {
                    warn!(stage = KIND, record = i, %reason, "record skipped");
                    self.rejected += 1;
                    outcomes.push((i, Err(ItemError::malformed(reason))));
                }
            }
        }

        let results = self.llm.invoke(payloads).await?;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        outcomes.extend(
            positions
                .into_iter()
                .zip(results)
                .map(|(i, r)| (i, r.map(|c| c.text))),
        );

        let mut failed = 0;
        let mut transport_failed = 0;
        for (i, outcome) in outcomes {
            let Some(record) = data.record_mut(i) else {
                continue;
            };
            match outcome {
                Ok(text) => {
                    record.insert(self.output_field.clone(), Value::String(text));
                }
                Err(err) => {
                    failed += 1;
                    if err.kind == ItemErrorKind::Transport {
                        transport_failed += 1;
                    }
                    let tagged = serde_json::to_value(&err).map_err(PipelineError::execution)?;
                    record.insert(self.error_field.clone(), tagged);
                }
            }
        }

        info!(
            stage = KIND,
            index = self.index,
            provider = %self.llm.name(),
            total,
            failed,
            "generation finished"
        );

        if let Some(max_rate) = self.max_error_rate {
            if total > 0 && (transport_failed as f64 / total as f64) > max_rate {
                return Err(PipelineError::TransportThreshold {
                    failed: transport_failed,
                    total,
                    max_rate,
                });
            }
        }
        Ok(data)
    }

    fn item_failures(&self) -> usize {
        self.rejected
    }
}

pub fn build(ctx: StageContext) -> PipelineResult<Box<dyn Stage>> {
    Ok(Box::new(GenerateStage::from_context(ctx)?))
}
