//! Error types for Replica Core

use thiserror::Error;

/// Failures raised while merging CRDT data or applying operations.
///
/// A causality gap is *not* an error: `apply_operation` reports it with
/// `Ok(false)` so the caller can request a resync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("Merge conflict for actor {actor}: {detail}")]
    MergeConflict { actor: String, detail: String },

    #[error("Invalid field: {0} does not exist")]
    InvalidField(String),

    #[error("Model type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),

    #[error("Invalid storage key: {0}")]
    InvalidStorageKey(String),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for Replica Core operations
pub type Result<T> = std::result::Result<T, Error>;
