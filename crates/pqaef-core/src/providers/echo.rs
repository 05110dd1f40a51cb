//! In-process `echo` provider: answers every prompt with itself (plus an optional
//! prefix). Useful for dry runs and for exercising device leasing without a model.

use super::{Backend, LocalBackend, ProviderContext};
use crate::errors::PipelineResult;
use crate::model::{Completion, ItemResult, ParamMap};
use serde_json::json;
use tracing::debug;

pub const KIND: &str = "echo";

#[derive(Debug)]
pub struct EchoBackend {
    name: String,
    prefix: String,
    devices: Vec<u32>,
    slices: usize,
}

impl EchoBackend {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            devices: Vec::new(),
            slices: 0,
        }
    }

    fn answer(&self, prompt: &str, params: &ParamMap) -> String {
        let text = format!("{}{}", self.prefix, prompt);
        // `max_tokens` trims to that many whitespace-separated words.
        match params.get("max_tokens").and_then(|v| v.as_u64()) {
            Some(limit) => text
                .split_whitespace()
                .take(limit as usize)
                .collect::<Vec<_>>()
                .join(" "),
            None => text,
        }
    }
}

impl LocalBackend for EchoBackend {
    fn generate(&mut self, prompts: &[String], params: &ParamMap) -> Vec<ItemResult> {
        self.slices += 1;
        prompts
            .iter()
            .map(|p| {
                Ok(Completion::new(&self.name, self.answer(p, params))
                    .with_raw(json!({ "devices": self.devices, "params": params })))
            })
            .collect()
    }

    fn release(&mut self) -> PipelineResult<()> {
        debug!(provider = %self.name, slices = self.slices, "echo backend released");
        Ok(())
    }
}

/// Factory registered under [`KIND`]. Config: `prefix` (string, optional).
pub fn build(ctx: &ProviderContext<'_>) -> PipelineResult<Backend> {
    let mut backend = EchoBackend::new(ctx.name, ctx.descriptor.config_str("prefix").unwrap_or(""));
    backend.devices = ctx.devices.to_vec();
    Ok(Backend::InProcess(Box::new(backend)))
}
