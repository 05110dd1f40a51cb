//! Canonical JSON (RFC 8785 / JCS) used for request-group signatures and record
//! fingerprints.
//!
//! `serde_jcs` sorts object keys lexicographically, emits no whitespace and
//! normalises numbers, so two maps with the same entries in a different insertion
//! order serialize to the same string.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize to a JCS canonical JSON string.
pub fn to_string<T: Serialize>(value: &T) -> Result<String> {
    serde_jcs::to_string(value).context("JCS canonicalization failed")
}

/// Hex SHA-256 of the canonical form of `value`.
pub fn sha256_hex<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_jcs::to_vec(value).context("JCS canonicalization failed")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
