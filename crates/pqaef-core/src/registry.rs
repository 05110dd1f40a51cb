//! Kind-name registries for providers and stages.
//!
//! A job names kinds as strings; the registries map those names to factories.
//! Lookups happen during preflight so an unknown kind fails before any provider
//! is constructed.

use crate::errors::PipelineResult;
use crate::providers::{echo, http, Backend, ProviderContext};
use crate::stage::{Stage, StageContext};
use crate::stages::{fingerprint, generate};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type ProviderFactory =
    Arc<dyn Fn(&ProviderContext<'_>) -> PipelineResult<Backend> + Send + Sync>;

pub type StageFactory = Arc<dyn Fn(StageContext) -> PipelineResult<Box<dyn Stage>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo`, `openai` and `http`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(echo::KIND, echo::build);
        reg.register(http::OPENAI_KIND, http::build_openai);
        reg.register(http::HTTP_KIND, http::build_http);
        reg
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&ProviderContext<'_>) -> PipelineResult<Backend> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        self
    }

    pub fn get(&self, kind: &str) -> Option<&ProviderFactory> {
        self.factories.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[derive(Clone)]
struct StageEntry {
    slots: Vec<String>,
    factory: StageFactory,
}

#[derive(Clone, Default)]
pub struct StageRegistry {
    entries: BTreeMap<String, StageEntry>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, e)| (k, &e.slots)))
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `generate` and `fingerprint`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(generate::KIND, generate::SLOTS, generate::build);
        reg.register(fingerprint::KIND, &[], fingerprint::build);
        reg
    }

    /// Register `factory` for `kind`. `slots` lists the provider slots a descriptor of
    /// this kind must bind.
    pub fn register<F>(&mut self, kind: &str, slots: &[&str], factory: F) -> &mut Self
    where
        F: Fn(StageContext) -> PipelineResult<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.entries.insert(
            kind.to_string(),
            StageEntry {
                slots: slots.iter().map(|s| s.to_string()).collect(),
                factory: Arc::new(factory),
            },
        );
        self
    }

    pub fn get(&self, kind: &str) -> Option<&StageFactory> {
        self.entries.get(kind).map(|e| &e.factory)
    }

    pub fn required_slots(&self, kind: &str) -> &[String] {
        self.entries.get(kind).map(|e| e.slots.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
