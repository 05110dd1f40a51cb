//! Error types for the pipeline engine.
//!
//! Two layers: [`PipelineError`] aborts a run, [`ItemError`] is a per-record value
//! that travels inside result tables and output records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category a fatal error is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    MalformedRecord,
    Transport,
    Resource,
    Stage,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::MalformedRecord => "malformed_record",
            Self::Transport => "transport",
            Self::Resource => "resource",
            Self::Stage => "stage",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Unknown kind, missing reference, invalid parameter.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A record could not be turned into a request and the caller chose to fail on it.
    #[error("malformed record at index {index}: {reason}")]
    MalformedRecord { index: usize, reason: String },

    /// Too many per-item transport failures for a stage to accept.
    #[error("transport failure rate {failed}/{total} exceeds the allowed {max_rate}")]
    TransportThreshold {
        failed: usize,
        total: usize,
        max_rate: f64,
    },

    /// Scarce resource could not be acquired or released.
    #[error("resource error ({provider}): {message}")]
    Resource { provider: String, message: String },

    /// Failure inside a stage implementation.
    #[error("stage execution failed: {0:#}")]
    Execution(#[source] anyhow::Error),

    /// The run was cancelled before it could finish.
    #[error("run cancelled")]
    Cancelled,

    /// Wraps the originating error with the stage that raised it.
    #[error("stage #{index} ({kind}) failed: {source}")]
    InStage {
        index: usize,
        kind: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn resource(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resource {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn execution(err: impl Into<anyhow::Error>) -> Self {
        Self::Execution(err.into())
    }

    pub(crate) fn in_stage(self, index: usize, kind: &str) -> Self {
        match self {
            already @ Self::InStage { .. } => already,
            other => Self::InStage {
                index,
                kind: kind.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Category of the originating error (looks through stage wrapping).
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::MalformedRecord { .. } => ErrorCategory::MalformedRecord,
            Self::TransportThreshold { .. } => ErrorCategory::Transport,
            Self::Resource { .. } => ErrorCategory::Resource,
            Self::Execution(_) => ErrorCategory::Stage,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::InStage { source, .. } => source.category(),
        }
    }

    /// `(index, kind)` of the stage that raised the error, if any.
    pub fn stage(&self) -> Option<(usize, &str)> {
        match self {
            Self::InStage { index, kind, .. } => Some((*index, kind.as_str())),
            _ => None,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Kind of a per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Network or provider call failure, including timeouts.
    Transport,
    /// The record could not be turned into a request.
    MalformedRecord,
    /// Not started, or abandoned, because the dispatch was cancelled.
    Cancelled,
    /// The worker handling the item died.
    Internal,
}

impl fmt::Display for ItemErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::MalformedRecord => "malformed_record",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Tagged per-item error. Stored in result tables and serialized into output records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error [{code}]: {message}")]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub code: String,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ItemErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ItemErrorKind::Transport, code, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::transport("timeout", format!("call timed out after {:?}", after))
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ItemErrorKind::MalformedRecord, "malformed_record", message)
    }

    pub fn cancelled() -> Self {
        Self::new(
            ItemErrorKind::Cancelled,
            "cancelled",
            "dispatch cancelled before the item completed",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ItemErrorKind::Internal, "internal", message)
    }

    pub fn is_transport(&self) -> bool {
        self.kind == ItemErrorKind::Transport
    }
}
