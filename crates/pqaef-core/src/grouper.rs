//! Partitions a heterogeneous request list into groups sharing identical effective
//! generation parameters.
//!
//! Each payload carries a `prompt` string; every other key is a per-item override
//! merged over the defaults (override wins). The group key is the JCS canonical
//! serialization of the merged map, so insertion order never splits a group.

use crate::canonical;
use crate::model::{merge_params, ParamMap, Payload, PROMPT_KEY};
use std::collections::BTreeMap;

/// Requests sharing one effective parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestGroup {
    pub params: ParamMap,
    /// `(original index, prompt)` in input order.
    pub members: Vec<(usize, String)>,
}

impl RequestGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.members.iter().map(|(i, _)| *i)
    }
}

/// A payload that could not be grouped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRequest {
    pub index: usize,
    pub reason: String,
}

/// Outcome of [`group`]: groups keyed by signature, plus rejected payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    pub groups: BTreeMap<String, RequestGroup>,
    pub malformed: Vec<MalformedRequest>,
}

impl Grouping {
    /// Number of payloads placed in a group.
    pub fn grouped_len(&self) -> usize {
        self.groups.values().map(RequestGroup::len).sum()
    }
}

/// Group `payloads` by effective parameters over `defaults`.
pub fn group(payloads: &[Payload], defaults: &ParamMap) -> Grouping {
    let mut out = Grouping::default();

    for (index, item) in payloads.iter().enumerate() {
        let prompt = match item.get(PROMPT_KEY) {
            Some(serde_json::Value::String(p)) => p.clone(),
            Some(other) => {
                out.malformed.push(MalformedRequest {
                    index,
                    reason: format!("'{}' must be a string, got {}", PROMPT_KEY, type_name(other)),
                });
                continue;
            }
            None => {
                out.malformed.push(MalformedRequest {
                    index,
                    reason: format!("missing '{}' field", PROMPT_KEY),
                });
                continue;
            }
        };

        let mut overrides = item.clone();
        overrides.remove(PROMPT_KEY);
        let params = merge_params(defaults, &overrides);

        let signature = match canonical::to_string(&params) {
            Ok(s) => s,
            Err(e) => {
                out.malformed.push(MalformedRequest {
                    index,
                    reason: format!("parameters cannot be canonicalized: {:#}", e),
                });
                continue;
            }
        };

        out.groups
            .entry(signature)
            .or_insert_with(|| RequestGroup {
                params,
                members: Vec::new(),
            })
            .members
            .push((index, prompt));
    }

    out
}

fn type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
