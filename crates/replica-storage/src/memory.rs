//! In-memory storage backend

use crate::{matches_pattern, RecordMeta, Storage, StorageError, StorageStats};
use async_trait::async_trait;
use dashmap::DashMap;
use replica_core::StorageKey;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory storage backend
///
/// Volatile; used for `ramdisk://` and `volatile://` keys and in tests.
pub struct MemoryStorage {
    /// key text -> (meta_bytes, data_bytes)
    data: DashMap<String, (Vec<u8>, Vec<u8>)>,
    total_size: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            total_size: AtomicUsize::new(0),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, key: &StorageKey, meta: &RecordMeta, data: &[u8]) -> Result<(), StorageError> {
        let meta_bytes = serde_json::to_vec(meta)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let new_size = meta_bytes.len() + data.len();
        let previous = self.data.insert(key.to_string(), (meta_bytes, data.to_vec()));

        if let Some((old_meta, old_data)) = previous {
            self.total_size
                .fetch_sub(old_meta.len() + old_data.len(), Ordering::Relaxed);
        }
        self.total_size.fetch_add(new_size, Ordering::Relaxed);
        Ok(())
    }

    async fn load(&self, key: &StorageKey) -> Result<Option<(RecordMeta, Vec<u8>)>, StorageError> {
        match self.data.get(&key.to_string()) {
            Some(entry) => {
                let (meta_bytes, data) = entry.value();
                let meta: RecordMeta = serde_json::from_slice(meta_bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some((meta, data.clone())))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool, StorageError> {
        match self.data.remove(&key.to_string()) {
            Some((_, (meta_bytes, data))) => {
                self.total_size
                    .fetch_sub(meta_bytes.len() + data.len(), Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<StorageKey>, StorageError> {
        let mut keys = Vec::new();
        for entry in self.data.iter() {
            let text = entry.key();
            if pattern.map_or(true, |p| matches_pattern(text, p)) {
                if let Ok(key) = StorageKey::parse(text) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(&key.to_string()))
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            record_count: self.data.len(),
            total_size_bytes: self.total_size.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::{CrdtKind, VersionMap};

    fn meta() -> RecordMeta {
        RecordMeta::new(CrdtKind::Set, VersionMap::from_entries([("a", 1)]))
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let storage = MemoryStorage::new();
        let key = StorageKey::ramdisk("people");

        storage.store(&key, &meta(), b"hello world").await.unwrap();

        let (loaded_meta, loaded_data) = storage.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded_meta, meta());
        assert_eq!(loaded_data, b"hello world");
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = MemoryStorage::new();
        let key = StorageKey::ramdisk("gone");

        storage.store(&key, &meta(), b"data").await.unwrap();
        assert!(storage.exists(&key).await.unwrap());

        assert!(storage.delete(&key).await.unwrap());
        assert!(!storage.exists(&key).await.unwrap());
        assert!(!storage.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_with_pattern() {
        let storage = MemoryStorage::new();
        let backing = StorageKey::ramdisk("backing");
        for i in 0..5 {
            let key = backing.child_with_component(&format!("e{}", i));
            storage.store(&key, &meta(), b"data").await.unwrap();
        }
        for i in 0..3 {
            let key = StorageKey::database("main", format!("cart{}", i));
            storage.store(&key, &meta(), b"data").await.unwrap();
        }

        let entities = storage.list(Some("ramdisk://backing/*")).await.unwrap();
        assert_eq!(entities.len(), 5);

        let carts = storage.list(Some("db://*")).await.unwrap();
        assert_eq!(carts.len(), 3);

        assert_eq!(storage.list(None).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_stats_track_overwrites() {
        let storage = MemoryStorage::new();
        let key = StorageKey::ramdisk("stats");

        storage.store(&key, &meta(), b"some data here").await.unwrap();
        let first = storage.stats().await.unwrap();
        assert_eq!(first.record_count, 1);

        storage.store(&key, &meta(), b"x").await.unwrap();
        let second = storage.stats().await.unwrap();
        assert_eq!(second.record_count, 1);
        assert_eq!(first.total_size_bytes - second.total_size_bytes, 13);

        storage.delete(&key).await.unwrap();
        assert_eq!(storage.stats().await.unwrap().total_size_bytes, 0);
    }
}
