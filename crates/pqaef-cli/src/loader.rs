//! Dataset loaders for `json` (top-level array of objects), `jsonl` (one object
//! per line), `csv` and `tsv` files. Sources are concatenated in declaration order;
//! files found by scanning a directory are read in path order.
//!
//! Delimited rows become `{"raw_data": [cells], "_source_file": .., "_row_index": n}`
//! with cells trimmed; blank rows are skipped.

use crate::run_config::{DataFormat, DataSource, LoadedRun};
use pqaef_core::{Dataset, PipelineError, PipelineResult, Record};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub fn load_sources(run: &LoadedRun) -> PipelineResult<Dataset> {
    let mut data = Dataset::new();
    for source in &run.config.data {
        let records = load_source(run, source)?;
        info!(
            source = source.name.as_deref().unwrap_or("-"),
            records = records.len(),
            "data source loaded"
        );
        for r in records {
            data.push(r);
        }
    }
    Ok(data)
}

fn load_source(run: &LoadedRun, source: &DataSource) -> PipelineResult<Vec<Record>> {
    let mut files = Vec::new();
    for raw in source.paths.iter() {
        let path = run.resolve(raw);
        if path.is_dir() {
            let suffix = source.format.map(DataFormat::suffix).ok_or_else(|| {
                PipelineError::config(format!(
                    "data source {}: 'format' is required to scan directory {}",
                    source.name.as_deref().unwrap_or("-"),
                    path.display()
                ))
            })?;
            let mut found = Vec::new();
            scan_dir(&path, suffix, source.recursive, &mut found)?;
            found.sort();
            files.extend(found);
        } else if path.exists() {
            files.push(path);
        } else {
            return Err(PipelineError::config(format!(
                "data path does not exist: {}",
                path.display()
            )));
        }
    }

    let mut records = Vec::new();
    for file in files {
        let format = source
            .format
            .or_else(|| DataFormat::from_path(&file))
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "cannot infer data format of {} (set 'format')",
                    file.display()
                ))
            })?;
        let mut loaded = read_file(&file, format, source.skip_header)?;
        debug!(file = %file.display(), records = loaded.len(), "data file read");
        records.append(&mut loaded);
        if let Some(limit) = source.limit {
            if records.len() >= limit {
                records.truncate(limit);
                break;
            }
        }
    }
    if records.is_empty() {
        warn!(source = source.name.as_deref().unwrap_or("-"), "data source is empty");
    }
    Ok(records)
}

fn scan_dir(
    dir: &Path,
    suffix: &str,
    recursive: bool,
    out: &mut Vec<PathBuf>,
) -> PipelineResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        PipelineError::config(format!("failed to read directory {}: {}", dir.display(), e))
    })?;
    for entry in entries {
        let path = entry
            .map_err(|e| PipelineError::config(format!("{}: {}", dir.display(), e)))?
            .path();
        if path.is_dir() {
            if recursive {
                scan_dir(&path, suffix, recursive, out)?;
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some(suffix) {
            out.push(path);
        }
    }
    Ok(())
}

pub fn read_file(
    path: &Path,
    format: DataFormat,
    skip_header: bool,
) -> PipelineResult<Vec<Record>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!("failed to read {}: {}", path.display(), e))
    })?;
    match format {
        DataFormat::Json => parse_json(&raw, path),
        DataFormat::Jsonl => parse_jsonl(&raw, path),
        DataFormat::Csv => {
            let reader = csv::ReaderBuilder::new()
                .has_headers(skip_header)
                .flexible(true)
                .from_reader(raw.as_bytes());
            parse_delimited(reader, path)
        }
        DataFormat::Tsv => {
            // Fields never carry quotes or tabs in TSV.
            let reader = csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .quoting(false)
                .has_headers(skip_header)
                .flexible(true)
                .from_reader(raw.as_bytes());
            parse_delimited(reader, path)
        }
    }
}

fn parse_delimited(
    mut reader: csv::Reader<&[u8]>,
    path: &Path,
) -> PipelineResult<Vec<Record>> {
    let source = path.display().to_string();
    let mut records = Vec::new();
    for (row_index, row) in reader.records().enumerate() {
        let row = row.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or_default();
            PipelineError::MalformedRecord {
                index: records.len(),
                reason: format!("{}:{}: {}", source, line, e),
            }
        })?;
        let cells: Vec<&str> = row.iter().map(str::trim).collect();
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }
        let value = json!({
            "raw_data": cells,
            "_source_file": source,
            "_row_index": row_index,
        });
        if let Value::Object(map) = value {
            records.push(map);
        }
    }
    Ok(records)
}

fn parse_json(raw: &str, path: &Path) -> PipelineResult<Vec<Record>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| PipelineError::config(format!("{}: invalid JSON: {}", path.display(), e)))?;
    let Value::Array(items) = value else {
        return Err(PipelineError::config(format!(
            "{}: expected a top-level array of records",
            path.display()
        )));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            _ => Err(PipelineError::MalformedRecord {
                index: i,
                reason: format!("{}: record is not an object", path.display()),
            }),
        })
        .collect()
}

fn parse_jsonl(raw: &str, path: &Path) -> PipelineResult<Vec<Record>> {
    let mut records = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => records.push(map),
            Ok(_) => {
                return Err(PipelineError::MalformedRecord {
                    index: records.len(),
                    reason: format!("{}:{}: record is not an object", path.display(), n + 1),
                })
            }
            Err(e) => {
                return Err(PipelineError::MalformedRecord {
                    index: records.len(),
                    reason: format!("{}:{}: {}", path.display(), n + 1, e),
                })
            }
        }
    }
    Ok(records)
}
