//! Built-in stage kinds.

pub mod fingerprint;
pub mod generate;

/// Default record field per-item errors are written to.
pub const DEFAULT_ERROR_FIELD: &str = "error";
