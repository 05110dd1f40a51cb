//! The stage contract and the context a stage is built from.

use crate::cancel::CancelToken;
use crate::errors::{PipelineError, PipelineResult};
use crate::model::{Dataset, ParamMap};
use crate::providers::ProviderHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One step of a pipeline. Takes the dataset by value and returns the next one.
///
/// `finalize` is called exactly once, only after `run` succeeded, and before the
/// stage's providers are released.
#[async_trait]
pub trait Stage: Send {
    async fn run(&mut self, data: Dataset) -> PipelineResult<Dataset>;

    fn finalize(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    /// Records the stage itself rejected or tagged without a provider call.
    /// Provider-side failures are counted by the handles and must not be
    /// included here.
    fn item_failures(&self) -> usize {
        0
    }
}

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Uninitialized,
    Resolved,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Resolved => "resolved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Provider handles bound to a stage, by slot name.
#[derive(Debug, Clone, Default)]
pub struct ProviderSet {
    slots: BTreeMap<String, Arc<ProviderHandle>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: impl Into<String>, handle: Arc<ProviderHandle>) {
        self.slots.insert(slot.into(), handle);
    }

    pub fn get(&self, slot: &str) -> Option<&Arc<ProviderHandle>> {
        self.slots.get(slot)
    }

    /// Handle bound to `slot`, or a configuration error naming the slot.
    pub fn require(&self, slot: &str) -> PipelineResult<Arc<ProviderHandle>> {
        self.slots.get(slot).cloned().ok_or_else(|| {
            PipelineError::config(format!("no provider bound to slot '{}'", slot))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<ProviderHandle>)> + '_ {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Everything a stage factory receives.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub index: usize,
    pub kind: String,
    pub params: ParamMap,
    pub providers: ProviderSet,
    pub cancel: CancelToken,
}

impl StageContext {
    pub fn new(index: usize, kind: impl Into<String>, params: ParamMap) -> Self {
        Self {
            index,
            kind: kind.into(),
            params,
            providers: ProviderSet::new(),
            cancel: CancelToken::new(),
        }
    }

    fn bad_param(&self, key: &str, want: &str) -> PipelineError {
        PipelineError::config(format!(
            "stage '{}': parameter '{}' must be {}",
            self.kind, key, want
        ))
    }

    pub fn str_param(&self, key: &str) -> PipelineResult<Option<&str>> {
        match self.params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(self.bad_param(key, "a string")),
        }
    }

    pub fn required_str(&self, key: &str) -> PipelineResult<&str> {
        self.str_param(key)?.ok_or_else(|| {
            PipelineError::config(format!(
                "stage '{}': missing required parameter '{}'",
                self.kind, key
            ))
        })
    }

    pub fn f64_param(&self, key: &str) -> PipelineResult<Option<f64>> {
        match self.params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v.as_f64().map(Some).ok_or_else(|| self.bad_param(key, "a number")),
        }
    }

    pub fn object_param(&self, key: &str) -> PipelineResult<Option<&ParamMap>> {
        match self.params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Object(m)) => Ok(Some(m)),
            Some(_) => Err(self.bad_param(key, "a map")),
        }
    }
}
