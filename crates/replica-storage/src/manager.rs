//! Store manager - opens and caches active stores by key

use crate::direct::DirectStores;
use crate::error::{StoreError, StoreResult};
use crate::gc::{GarbageCollector, GarbageReport};
use crate::reference_mode::ReferenceModeStore;
use crate::store::ActiveStore;
use crate::Storage;
use dashmap::DashMap;
use replica_core::{CrdtKind, StorageKey};
use std::sync::Arc;
use tracing::info;

/// Hands out one live store per storage key over a shared backend.
///
/// Reference-mode keys get a [`ReferenceModeStore`]; every other
/// persistable key gets a direct store. Foreign keys name external id
/// namespaces and cannot be opened.
#[derive(Clone)]
pub struct StoreManager {
    direct: DirectStores,
    reference_mode: Arc<DashMap<String, Arc<ReferenceModeStore>>>,
    gc: Arc<GarbageCollector>,
}

impl StoreManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            direct: DirectStores::new(storage),
            reference_mode: Arc::new(DashMap::new()),
            gc: Arc::new(GarbageCollector::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        self.direct.storage()
    }

    pub fn direct_stores(&self) -> &DirectStores {
        &self.direct
    }

    /// Get or open the store for `key`.
    pub async fn get(&self, key: &StorageKey, kind: CrdtKind) -> StoreResult<Arc<dyn ActiveStore>> {
        match key {
            StorageKey::Foreign { .. } => Err(StoreError::UnsupportedKey(key.to_string())),
            StorageKey::ReferenceMode { .. } => {
                let store = self.reference_mode_store(key, kind).await?;
                Ok(store)
            }
            _ => {
                let store = self.direct.open(key, kind).await?;
                Ok(store)
            }
        }
    }

    pub async fn reference_mode_store(&self, key: &StorageKey, kind: CrdtKind) -> StoreResult<Arc<ReferenceModeStore>> {
        let name = key.to_string();
        if let Some(existing) = self.reference_mode.get(&name).map(|r| r.value().clone()) {
            return check_kind(existing, kind);
        }

        let store = ReferenceModeStore::open(key.clone(), kind, self.direct.clone()).await?;
        let entry = self
            .reference_mode
            .entry(name)
            .or_insert_with(|| store.clone())
            .value()
            .clone();
        if !Arc::ptr_eq(&entry, &store) {
            // Lost a race with another opener.
            store.close().await;
        } else {
            info!(key = %key, kind = %kind, "Registered reference-mode store");
        }
        check_kind(entry, kind)
    }

    /// Open reference-mode stores.
    pub fn reference_mode_stores(&self) -> Vec<Arc<ReferenceModeStore>> {
        self.reference_mode.iter().map(|r| r.value().clone()).collect()
    }

    /// One garbage collection pass over backing entities. Orphans marked
    /// here are deleted by a later pass.
    pub async fn collect_garbage(&self) -> StoreResult<GarbageReport> {
        self.gc.run(self).await
    }

    /// Open stores of both sorts.
    pub fn len(&self) -> usize {
        self.direct.len() + self.reference_mode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close_all(&self) {
        let stores = self.reference_mode_stores();
        self.reference_mode.clear();
        for store in stores {
            store.close().await;
        }
        self.direct.close_all().await;
    }
}

fn check_kind(store: Arc<ReferenceModeStore>, kind: CrdtKind) -> StoreResult<Arc<ReferenceModeStore>> {
    if store.kind() != kind {
        return Err(StoreError::KindMismatch {
            expected: store.kind(),
            got: kind,
        });
    }
    Ok(store)
}
