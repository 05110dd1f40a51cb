//! Run file: a job specification plus where the data comes from and where the
//! results go.
//!
//! ```yaml
//! version: 1
//! providers: { ... }
//! stages: [ ... ]
//! data:
//!   - name: mmlu
//!     paths: data/mmlu.jsonl
//! output:
//!   dir: out
//! ```
//!
//! Relative paths resolve against the directory holding the run file.

use pqaef_core::config::SUPPORTED_JOB_VERSION;
use pqaef_core::{
    JobSpec, PipelineError, PipelineResult, ProviderDescriptor, Settings, StageDescriptor,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_FILE_PREFIX: &str = "processed_data";
pub const DEFAULT_CHUNK_SIZE: usize = 5000;
pub const UNKNOWN_MODEL: &str = "unknown_model";
pub const UNKNOWN_DATASET: &str = "unknown_dataset";

fn default_version() -> u32 {
    SUPPORTED_JOB_VERSION
}

fn default_prefix() -> String {
    DEFAULT_FILE_PREFIX.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Jsonl,
    Csv,
    Tsv,
}

impl DataFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "jsonl" => Some(Self::Jsonl),
            "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            _ => None,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Csv => "csv",
            Self::Tsv => "tsv",
        }
    }
}

/// One path or a list of paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathList {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl PathList {
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> + '_ {
        let slice: &[PathBuf] = match self {
            Self::One(p) => std::slice::from_ref(p),
            Self::Many(v) => v,
        };
        slice.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(default)]
    pub name: Option<String>,
    /// Inferred from the file extension when absent.
    #[serde(default)]
    pub format: Option<DataFormat>,
    /// Files, or directories scanned for files of the source's format.
    pub paths: PathList,
    #[serde(default)]
    pub recursive: bool,
    /// Keep at most this many records from the source.
    #[serde(default)]
    pub limit: Option<usize>,
    /// `csv`/`tsv` only: treat the first row as a header and drop it.
    #[serde(default = "default_true")]
    pub skip_header: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    #[serde(default = "default_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Write into `{dir}/{model}/{dataset}` rather than `{dir}`.
    #[serde(default = "default_true")]
    pub nest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderDescriptor>,
    #[serde(default)]
    pub stages: Vec<StageDescriptor>,
    #[serde(default)]
    pub data: Vec<DataSource>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
}

/// A parsed run file and the directory its relative paths resolve against.
#[derive(Debug, Clone)]
pub struct LoadedRun {
    pub config: RunConfig,
    pub base_dir: PathBuf,
    pub ignored_keys: Vec<String>,
}

impl RunConfig {
    pub fn from_yaml_str(raw: &str) -> PipelineResult<(Self, Vec<String>)> {
        let mut ignored = Vec::new();
        let de = serde_yaml::Deserializer::from_str(raw);
        let config: RunConfig = serde_ignored::deserialize(de, |path| {
            ignored.push(path.to_string());
        })
        .map_err(|e| PipelineError::config(format!("failed to parse YAML: {}", e)))?;
        config.job().check()?;
        if let Some(out) = &config.output {
            if out.chunk_size == 0 {
                return Err(PipelineError::config("output.chunk_size must be at least 1"));
            }
        }
        Ok((config, ignored))
    }

    pub fn load(path: &Path) -> PipelineResult<LoadedRun> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let (config, ignored_keys) = Self::from_yaml_str(&raw).map_err(|e| match e {
            PipelineError::Configuration { message } => {
                PipelineError::config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })?;
        for key in &ignored_keys {
            warn!(config = %path.display(), key = %key, "ignoring unknown config key");
        }
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(LoadedRun {
            config,
            base_dir,
            ignored_keys,
        })
    }

    pub fn job(&self) -> JobSpec {
        JobSpec {
            version: self.version,
            settings: self.settings.clone(),
            providers: self.providers.clone(),
            stages: self.stages.clone(),
        }
    }

    /// First provider's `model_identifier`, else its name.
    pub fn model_name(&self) -> String {
        self.providers
            .iter()
            .next()
            .map(|(name, p)| {
                p.config_str("model_identifier")
                    .filter(|m| !m.is_empty())
                    .unwrap_or(name)
                    .replace('/', "_")
            })
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string())
    }

    /// First data source's name, else the stem of its first path.
    pub fn dataset_name(&self) -> String {
        let Some(source) = self.data.first() else {
            return UNKNOWN_DATASET.to_string();
        };
        source
            .name
            .clone()
            .or_else(|| {
                source
                    .paths
                    .iter()
                    .next()
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| UNKNOWN_DATASET.to_string())
    }
}

impl LoadedRun {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Final output directory: `override_dir` or `output.dir`, nested per model and
    /// dataset unless disabled. `None` when no output is configured.
    pub fn output_dir(&self, override_dir: Option<&Path>) -> Option<PathBuf> {
        let out = self.config.output.as_ref();
        let base = match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.resolve(&out?.dir),
        };
        if out.map(|o| o.nest).unwrap_or(true) {
            Some(
                base.join(self.config.model_name())
                    .join(self.config.dataset_name()),
            )
        } else {
            Some(base)
        }
    }
}
