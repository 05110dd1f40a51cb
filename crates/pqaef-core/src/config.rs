//! Job specification: the declarative stage list plus named provider descriptors.

use crate::errors::{PipelineError, PipelineResult};
use crate::model::ParamMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const SUPPORTED_JOB_VERSION: u32 = 1;

fn default_version() -> u32 {
    SUPPORTED_JOB_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderDescriptor>,
    #[serde(default)]
    pub stages: Vec<StageDescriptor>,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            version: SUPPORTED_JOB_VERSION,
            settings: Settings::default(),
            providers: BTreeMap::new(),
            stages: Vec::new(),
        }
    }
}

/// Run-wide defaults applied where a provider does not set its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Registered stage kind.
    pub kind: String,
    /// Optional label used in logs and reports.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub params: ParamMap,
    /// Slot name (as the stage knows it) to provider name in [`JobSpec::providers`].
    #[serde(default)]
    pub providers: BTreeMap<String, String>,
}

impl StageDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            params: ParamMap::new(),
            providers: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn with_provider(mut self, slot: &str, provider: &str) -> Self {
        self.providers.insert(slot.to_string(), provider.to_string());
        self
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Registered provider kind.
    pub kind: String,
    /// Connection / construction parameters, interpreted by the provider kind.
    #[serde(default)]
    pub config: ParamMap,
    /// Max in-flight requests for network providers.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Per-call timeout for network providers.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Slice size for in-process providers.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Default generation parameters; per-item overrides win.
    #[serde(default)]
    pub generation: ParamMap,
    #[serde(default)]
    pub device_ids: Vec<u32>,
}

impl ProviderDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: ParamMap::new(),
            concurrency: None,
            timeout_secs: None,
            batch_size: None,
            generation: ParamMap::new(),
            device_ids: Vec::new(),
        }
    }

    pub fn with_config(mut self, key: &str, value: serde_json::Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_generation(mut self, key: &str, value: serde_json::Value) -> Self {
        self.generation.insert(key.to_string(), value);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// String value from `config`.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

impl JobSpec {
    /// Parse and check a job. Unknown keys are logged, not rejected.
    pub fn from_yaml_str(raw: &str) -> PipelineResult<Self> {
        let de = serde_yaml::Deserializer::from_str(raw);
        let job: JobSpec = serde_ignored::deserialize(de, |path| {
            warn!(key = %path, "ignoring unknown job key");
        })
        .map_err(|e| PipelineError::config(format!("failed to parse YAML: {}", e)))?;
        job.check()?;
        Ok(job)
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Union of every provider's `device_ids`.
    pub fn visible_devices(&self) -> BTreeSet<u32> {
        self.providers
            .values()
            .flat_map(|p| p.device_ids.iter().copied())
            .collect()
    }

    /// Structural checks that need no registry: version, references, limits.
    pub fn check(&self) -> PipelineResult<()> {
        if self.version != SUPPORTED_JOB_VERSION {
            return Err(PipelineError::config(format!(
                "unsupported job version {} (supported: {})",
                self.version, SUPPORTED_JOB_VERSION
            )));
        }
        if self.settings.concurrency == Some(0) {
            return Err(PipelineError::config("settings.concurrency must be at least 1"));
        }
        for (name, p) in &self.providers {
            if p.concurrency == Some(0) {
                return Err(PipelineError::config(format!(
                    "provider '{}': concurrency must be at least 1",
                    name
                )));
            }
            if p.batch_size == Some(0) {
                return Err(PipelineError::config(format!(
                    "provider '{}': batch_size must be at least 1",
                    name
                )));
            }
        }
        for (index, stage) in self.stages.iter().enumerate() {
            for (slot, provider) in &stage.providers {
                if !self.providers.contains_key(provider) {
                    return Err(PipelineError::config(format!(
                        "stage #{} ({}): slot '{}' references unknown provider '{}'",
                        index,
                        stage.label(),
                        slot,
                        provider
                    )));
                }
            }
        }
        Ok(())
    }
}
