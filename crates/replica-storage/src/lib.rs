//! Replica Storage
//!
//! Persistence backends and the stores built on top of them:
//! - Memory (default) and SQLite backends behind the [`Storage`] trait
//! - [`DirectStore`]: one CRDT model, persisted after each change
//! - [`ReferenceModeStore`]: entities split into a container of references
//!   and per-entity backing stores
//! - [`Handle`]: a storage proxy with a local model copy
//! - [`RemovalManager`]: TTL sweeps and cascading deletes
//! - [`GarbageCollector`]: deletes backing entities nothing references

pub mod backing;
pub mod direct;
pub mod error;
pub mod gc;
pub mod handle;
pub mod manager;
pub mod memory;
pub mod message_queue;
pub mod reference_mode;
pub mod removal;
pub mod send_queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

use async_trait::async_trait;
use replica_core::{CrdtKind, StorageKey, VersionMap};
use serde::{Deserialize, Serialize};

/// Metadata stored beside every persisted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub kind: CrdtKind,
    pub version: VersionMap,
}

impl RecordMeta {
    pub fn new(kind: CrdtKind, version: VersionMap) -> Self {
        Self { kind, version }
    }
}

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a serialized model
    async fn store(&self, key: &StorageKey, meta: &RecordMeta, data: &[u8]) -> Result<(), StorageError>;

    /// Load a serialized model
    async fn load(&self, key: &StorageKey) -> Result<Option<(RecordMeta, Vec<u8>)>, StorageError>;

    /// Delete a record
    async fn delete(&self, key: &StorageKey) -> Result<bool, StorageError>;

    /// List keys whose textual form matches a glob pattern
    async fn list(&self, pattern: Option<&str>) -> Result<Vec<StorageKey>, StorageError>;

    /// Check if a record exists
    async fn exists(&self, key: &StorageKey) -> Result<bool, StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub record_count: usize,
    pub total_size_bytes: usize,
}

/// Simple glob pattern matching over a key's textual form
pub(crate) fn matches_pattern(key: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return key.ends_with(suffix);
    }

    key == pattern
}

pub use backing::BackingStore;
pub use direct::{DirectStore, DirectStores};
pub use error::{StoreError, StoreResult};
pub use gc::{GarbageCollector, GarbageReport};
pub use handle::{Handle, HandleOptions};
pub use manager::StoreManager;
pub use memory::MemoryStorage;
pub use message_queue::{MessageQueue, Receipt};
pub use reference_mode::ReferenceModeStore;
pub use removal::{ForeignReferenceChecker, RemovalManager, RemovalReport};
pub use send_queue::SendQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
pub use store::ActiveStore;
