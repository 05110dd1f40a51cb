//! Writes the final dataset as chunked, pretty-printed JSON files
//! (`{prefix}_{NNNN}.json`) plus a `run_report.json` next to them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pqaef_core::{Dataset, Record, RunReport};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

pub const REPORT_FILE: &str = "run_report.json";

/// Run report as written to disk: the engine's report plus wall-clock context.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub config: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_files: Vec<PathBuf>,
    #[serde(flatten)]
    pub report: RunReport,
}

#[derive(Debug, Clone)]
pub struct JsonDumper {
    dir: PathBuf,
    prefix: String,
    chunk_size: usize,
}

impl JsonDumper {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create output dir {}", self.dir.display()))
    }

    /// Returns the written chunk paths, in order.
    pub fn dump(&self, data: &Dataset) -> Result<Vec<PathBuf>> {
        if data.is_empty() {
            warn!(dir = %self.dir.display(), "no data to dump");
            return Ok(Vec::new());
        }
        self.ensure_dir()?;

        let chunks = data.len().div_ceil(self.chunk_size);
        info!(
            records = data.len(),
            chunk_size = self.chunk_size,
            chunks,
            dir = %self.dir.display(),
            "writing dataset"
        );

        let mut written = Vec::with_capacity(chunks);
        for (i, chunk) in data.shared().chunks(self.chunk_size).enumerate() {
            let path = self.dir.join(format!("{}_{:04}.json", self.prefix, i));
            let records: Vec<&Record> = chunk.iter().map(|r| r.as_ref()).collect();
            let body =
                serde_json::to_string_pretty(&records).context("failed to serialize chunk")?;
            fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }

    pub fn write_report(&self, summary: &RunSummary) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.dir.join(REPORT_FILE);
        let body =
            serde_json::to_string_pretty(summary).context("failed to serialize run report")?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}
