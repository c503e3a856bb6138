//! Garbage collection of backing entities
//!
//! Removing an entity from a reference-mode collection only drops the
//! reference: other collections over the same backing key may still point
//! at the entity. A collection pass finds backing entities nothing
//! references any more and deletes them in two steps. The first pass that
//! sees an entity unreferenced marks it as an orphan; a later pass deletes
//! it if it is still unreferenced, or clears the mark if a reference came
//! back in between.

use crate::error::StoreResult;
use crate::manager::StoreManager;
use crate::store::ActiveStore;
use parking_lot::Mutex;
use replica_core::{CrdtData, CrdtKind, FieldValue, Reference, StorageKey};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageReport {
    /// Newly marked as orphans.
    pub marked: usize,
    /// Deleted after staying unreferenced for a whole pass.
    pub collected: usize,
    /// Orphans referenced again and unmarked.
    pub revived: usize,
}

#[derive(Default)]
pub struct GarbageCollector {
    orphans: Mutex<HashSet<String>>,
}

/// What one scan of the backend found.
#[derive(Default)]
struct Scan {
    /// `<backing key>/<id>` of every referenced entity.
    referenced: HashSet<String>,
    /// Keys references point into.
    backing_keys: Vec<StorageKey>,
    /// Persisted entity records with their ids.
    entities: Vec<(StorageKey, String)>,
}

impl Scan {
    fn add_references<'a>(&mut self, references: impl IntoIterator<Item = &'a Reference>) {
        for reference in references {
            if reference.is_foreign() {
                continue;
            }
            self.referenced
                .insert(reference.storage_key.child_with_component(&reference.id).to_string());
            if !self.backing_keys.contains(&reference.storage_key) {
                self.backing_keys.push(reference.storage_key.clone());
            }
        }
    }
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one pass over everything `manager`'s backend holds.
    pub async fn run(&self, manager: &StoreManager) -> StoreResult<GarbageReport> {
        let mut scan = self.scan(manager).await?;
        for store in manager.reference_mode_stores() {
            let key = store.backing().storage_key();
            if !scan.backing_keys.contains(key) {
                scan.backing_keys.push(key.clone());
            }
        }

        let mut report = GarbageReport::default();
        let mut seen = HashSet::new();
        for (key, id) in &scan.entities {
            let Some(base) = scan
                .backing_keys
                .iter()
                .find(|base| base.child_with_component(id) == *key)
                .cloned()
            else {
                continue;
            };
            let name = key.to_string();
            seen.insert(name.clone());

            let marked = self.orphans.lock().contains(&name);
            let referenced = scan.referenced.contains(&name);
            match (referenced, marked) {
                (true, true) => {
                    self.orphans.lock().remove(&name);
                    report.revived += 1;
                }
                (true, false) => {}
                (false, false) => {
                    debug!(key = %key, "Marking backing entity as orphan");
                    self.orphans.lock().insert(name);
                    report.marked += 1;
                }
                (false, true) => {
                    self.orphans.lock().remove(&name);
                    if self.collect(manager, &base, key, id).await? {
                        report.collected += 1;
                    } else {
                        report.revived += 1;
                    }
                }
            }
        }
        self.orphans.lock().retain(|name| seen.contains(name));

        if report != GarbageReport::default() {
            info!(
                marked = report.marked,
                collected = report.collected,
                revived = report.revived,
                "Backing garbage collection"
            );
        }
        Ok(report)
    }

    async fn scan(&self, manager: &StoreManager) -> StoreResult<Scan> {
        let storage = manager.storage();
        let mut scan = Scan::default();
        for key in storage.list(None).await? {
            let Some((meta, bytes)) = storage.load(&key).await? else {
                continue;
            };
            let data: CrdtData = match serde_json::from_slice(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            match (&data, meta.kind) {
                (CrdtData::Entity(entity), CrdtKind::Entity) => {
                    let raw = entity.to_raw_entity();
                    scan.add_references(raw.references());
                    if !entity.id.is_empty() {
                        scan.entities.push((key, entity.id.clone()));
                    }
                }
                _ => {
                    if let Some(collection) = data.as_collection() {
                        let values: Vec<&FieldValue> = collection.values.values().map(|e| &e.value).collect();
                        scan.add_references(values.into_iter().flat_map(FieldValue::references));
                    }
                }
            }
        }
        Ok(scan)
    }

    /// Deletes an orphan unless an open store took it back. Every store
    /// over `base` lets go of it first. Returns whether it was deleted.
    async fn collect(&self, manager: &StoreManager, base: &StorageKey, key: &StorageKey, id: &str) -> StoreResult<bool> {
        for store in manager.reference_mode_stores() {
            if store.backing().storage_key() == base && !store.release_backing(id).await {
                debug!(key = %key, holder = %store.storage_key(), "Orphan referenced again");
                return Ok(false);
            }
        }
        manager.direct_stores().purge(key).await?;
        debug!(key = %key, "Collected orphaned backing entity");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Handle, HandleOptions, MemoryStorage, Storage};
    use replica_core::RawEntity;
    use std::sync::Arc;

    fn collection(name: &str) -> StorageKey {
        StorageKey::reference_mode(StorageKey::ramdisk("people"), StorageKey::ramdisk(name))
    }

    async fn open(manager: &StoreManager, key: &StorageKey, name: &str) -> Arc<Handle> {
        let store = manager.get(key, CrdtKind::Set).await.unwrap();
        let handle = Handle::open(name, store, HandleOptions::default()).await.unwrap();
        handle.idle().await;
        handle
    }

    #[tokio::test]
    async fn test_shared_entity_outlives_one_collection() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let manager = StoreManager::new(storage.clone());
        let first = open(&manager, &collection("first"), "h1").await;
        let second = open(&manager, &collection("second"), "h2").await;
        let entity = RawEntity::new("e1");
        first.store(entity.clone()).await.unwrap();
        second.store(entity.clone()).await.unwrap();
        first.remove(&entity).await.unwrap();
        first.idle().await;
        second.idle().await;

        let backing_key = StorageKey::ramdisk("people/e1");
        for _ in 0..2 {
            assert_eq!(manager.collect_garbage().await.unwrap(), GarbageReport::default());
        }
        assert!(storage.exists(&backing_key).await.unwrap());

        second.remove(&entity).await.unwrap();
        second.idle().await;
        let report = manager.collect_garbage().await.unwrap();
        assert_eq!(report.marked, 1);
        assert!(storage.exists(&backing_key).await.unwrap());

        let report = manager.collect_garbage().await.unwrap();
        assert_eq!(report.collected, 1);
        assert!(!storage.exists(&backing_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphan_referenced_again_is_unmarked() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let manager = StoreManager::new(storage.clone());
        let handle = open(&manager, &collection("only"), "h").await;
        let entity = RawEntity::new("e1");
        handle.store(entity.clone()).await.unwrap();
        handle.remove(&entity).await.unwrap();
        handle.idle().await;

        assert_eq!(manager.collect_garbage().await.unwrap().marked, 1);
        handle.store(entity.clone()).await.unwrap();
        handle.idle().await;

        let report = manager.collect_garbage().await.unwrap();
        assert_eq!(report, GarbageReport { revived: 1, ..Default::default() });
        assert!(storage.exists(&StorageKey::ramdisk("people/e1")).await.unwrap());
        assert_eq!(manager.collect_garbage().await.unwrap(), GarbageReport::default());
    }

    #[tokio::test]
    async fn test_entities_held_by_field_references_stay() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let manager = StoreManager::new(storage.clone());
        let people = open(&manager, &collection("people-list"), "h").await;
        let notes = open(&manager, &StorageKey::ramdisk("notes"), "h").await;

        let ann = RawEntity::new("ann");
        people.store(ann.clone()).await.unwrap();
        let owner = people.create_reference(&ann, false).unwrap();
        notes
            .store(RawEntity::new("n1").with_singleton("owner", Some(owner.into())))
            .await
            .unwrap();
        people.remove(&ann).await.unwrap();
        people.idle().await;
        notes.idle().await;

        for _ in 0..2 {
            assert_eq!(manager.collect_garbage().await.unwrap(), GarbageReport::default());
        }
        assert!(storage.exists(&StorageKey::ramdisk("people/ann")).await.unwrap());
    }
}
