//! Store-level errors

use crate::StorageError;
use replica_core::{CrdtError, CrdtKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store kind mismatch: expected {expected}, got {got}")]
    KindMismatch { expected: CrdtKind, got: CrdtKind },

    #[error("Unsupported CRDT kind for this store: {0}")]
    UnsupportedKind(CrdtKind),

    #[error("Unsupported storage key: {0}")]
    UnsupportedKey(String),

    #[error("Entity not held by this handle: {0}")]
    UnknownEntity(String),

    #[error("Store closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
