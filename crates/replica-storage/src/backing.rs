//! Per-entity backing stores behind one storage key

use crate::direct::{DirectStore, DirectStores};
use crate::error::StoreResult;
use crate::store::ActiveStore;
use dashmap::DashMap;
use replica_core::crdt::EntityData;
use replica_core::{CrdtData, CrdtKind, ReferenceId, StorageKey, VersionMap};
use replica_protocol::{CallbackId, ProxyMessage};
use std::sync::Arc;
use tracing::debug;

/// Receives every message a backing store sends, tagged with the entity id.
pub type BackingCallback = Arc<dyn Fn(ReferenceId, ProxyMessage) + Send + Sync>;

struct Entry {
    store: Arc<DirectStore>,
    callback_id: CallbackId,
}

/// Multiplexes one entity-kind [`DirectStore`] per entity id, each at
/// `base/<id>`, under a single subscription callback.
pub struct BackingStore {
    base: StorageKey,
    stores: DirectStores,
    entries: DashMap<ReferenceId, Entry>,
    callback: BackingCallback,
}

impl BackingStore {
    pub fn new(base: StorageKey, stores: DirectStores, callback: BackingCallback) -> Self {
        Self {
            base,
            stores,
            entries: DashMap::new(),
            callback,
        }
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.base
    }

    pub fn key_for(&self, id: &str) -> StorageKey {
        self.base.child_with_component(id)
    }

    /// Opens (or reuses) the store for `id` and subscribes to it.
    pub async fn store_for(&self, id: &str) -> StoreResult<Arc<DirectStore>> {
        if let Some(entry) = self.entries.get(id) {
            return Ok(entry.store.clone());
        }

        let store = self.stores.open(&self.key_for(id), CrdtKind::Entity).await?;
        if let Some(entry) = self.entries.get(id) {
            return Ok(entry.store.clone());
        }

        let callback = self.callback.clone();
        let entity_id = id.to_string();
        let callback_id = store
            .on(Arc::new(move |message| callback(entity_id.clone(), message)))
            .await?;
        self.entries.insert(
            id.to_string(),
            Entry {
                store: store.clone(),
                callback_id,
            },
        );
        Ok(store)
    }

    pub fn get(&self, id: &str) -> Option<Arc<DirectStore>> {
        self.entries.get(id).map(|entry| entry.store.clone())
    }

    /// Current entity data, if the store for `id` is open.
    pub fn entity(&self, id: &str) -> Option<EntityData> {
        match self.get(id)?.local_data() {
            CrdtData::Entity(data) => Some(data),
            _ => None,
        }
    }

    pub fn version_of(&self, id: &str) -> Option<VersionMap> {
        self.get(id).map(|store| store.version_map())
    }

    /// Delivers `message` to the store for `id` as coming from this muxer.
    pub async fn on_proxy_message(&self, id: &str, message: ProxyMessage) -> StoreResult<bool> {
        let store = self.store_for(id).await?;
        let callback_id = self.entries.get(id).map(|entry| entry.callback_id);
        store.on_proxy_message(message.with_id(callback_id)).await
    }

    /// Unsubscribes from `id` and forgets its store. The persisted data
    /// stays. Returns whether the store was open here.
    pub async fn release(&self, id: &str) -> StoreResult<bool> {
        let Some((_, entry)) = self.entries.remove(id) else {
            return Ok(false);
        };
        entry.store.off(entry.callback_id).await?;
        debug!(key = %self.base, id, "Released backing entity");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unsubscribes from every open entity store.
    pub async fn close(&self) {
        let entries: Vec<(Arc<DirectStore>, CallbackId)> = self
            .entries
            .iter()
            .map(|entry| (entry.store.clone(), entry.callback_id))
            .collect();
        self.entries.clear();
        for (store, callback_id) in entries {
            let _ = store.off(callback_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use parking_lot::Mutex;
    use replica_core::{FieldValue, RawEntity};

    #[tokio::test]
    async fn test_writes_route_to_per_entity_stores() {
        let stores = DirectStores::new(Arc::new(MemoryStorage::new()));
        let seen: Arc<Mutex<Vec<ReferenceId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let backing = BackingStore::new(
            StorageKey::ramdisk("backing"),
            stores.clone(),
            Arc::new(move |id, _| sink.lock().push(id)),
        );

        let entity = RawEntity::new("e1").with_singleton("name", Some(FieldValue::text("Ann")));
        let data = EntityData::from_raw(&entity, VersionMap::from_entries([("w", 1)]));
        assert!(backing
            .on_proxy_message("e1", ProxyMessage::model_update(CrdtData::Entity(data), None))
            .await
            .unwrap());

        assert_eq!(backing.entity("e1").unwrap().to_raw_entity(), entity);
        assert_eq!(backing.version_of("e1").unwrap().get("w"), 1);
        assert!(stores.get(&StorageKey::ramdisk("backing/e1")).is_some());
        // Our own write is not echoed back.
        assert!(seen.lock().is_empty());

        // Another writer on the same entity is.
        let shared = stores.get(&StorageKey::ramdisk("backing/e1")).unwrap();
        let update = EntityData::from_raw(&entity, VersionMap::from_entries([("w", 1), ("x", 1)]));
        shared
            .on_proxy_message(ProxyMessage::model_update(CrdtData::Entity(update), None))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["e1".to_string()]);

        assert!(backing.release("e1").await.unwrap());
        assert!(backing.get("e1").is_none());
        assert!(!backing.release("e1").await.unwrap());
        assert_eq!(shared.subscriber_count(), 0);
    }
}
