use crate::errors::ItemError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// One record of the dataset: field name to value.
pub type Record = Map<String, Value>;

/// Generation parameters (temperature, max_tokens, ...).
pub type ParamMap = Map<String, Value>;

/// A request handed to a provider: a `prompt` string plus per-item parameter overrides.
pub type Payload = Map<String, Value>;

/// Field a payload carries its prompt in.
pub const PROMPT_KEY: &str = "prompt";

/// Result of one provider call.
pub type ItemResult<T = Completion> = Result<T, ItemError>;

/// Build a payload from a prompt and its overrides.
pub fn payload(prompt: impl Into<String>, overrides: &ParamMap) -> Payload {
    let mut p = overrides.clone();
    p.insert(PROMPT_KEY.to_string(), Value::String(prompt.into()));
    p
}

/// Effective parameters: `base` merged with `overrides`, override wins on collisions.
pub fn merge_params(base: &ParamMap, overrides: &ParamMap) -> ParamMap {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Successful provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub provider: String,
    #[serde(default)]
    pub raw: Value,
}

impl Completion {
    pub fn new(provider: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            provider: provider.into(),
            raw: Value::Null,
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Ordered, copy-on-write sequence of records.
///
/// Records are shared behind `Arc`; [`Dataset::record_mut`] clones a record only when
/// another holder still references it, so a stage never mutates data a previous
/// stage (or a caller) kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    records: Vec<Arc<Record>>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: records.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_shared(records: Vec<Arc<Record>>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index).map(|r| r.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        self.records.iter().map(|r| r.as_ref())
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(Arc::new(record));
    }

    /// Mutable access to one record, cloning it first if it is shared.
    pub fn record_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.records.get_mut(index).map(Arc::make_mut)
    }

    /// Keep only the records for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&Record) -> bool) {
        self.records.retain(|r| keep(r));
    }

    pub fn shared(&self) -> &[Arc<Record>] {
        &self.records
    }

    /// Owned records; shared records are cloned.
    pub fn into_records(self) -> Vec<Record> {
        self.records
            .into_iter()
            .map(|r| Arc::try_unwrap(r).unwrap_or_else(|shared| (*shared).clone()))
            .collect()
    }
}

impl FromIterator<Record> for Dataset {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self::from_records(iter)
    }
}
