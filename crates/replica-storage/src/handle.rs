//! Storage proxy with a local model copy
//!
//! A [`Handle`] subscribes to an [`ActiveStore`], keeps its own CRDT model in
//! step with it and turns `store`/`remove`/`clear` calls into operations.
//! Inbound traffic is handled in order through a [`MessageQueue`].

use crate::error::{StoreError, StoreResult};
use crate::message_queue::{MessageQueue, Receipt};
use crate::store::ActiveStore;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use replica_core::crdt::{SetOperation, SingletonOperation};
use replica_core::{
    CrdtKind, CrdtModel, CrdtOperation, RawEntity, Reference, StorageKey, SystemTimeSource, TimeSource, Ttl,
    VersionMap,
};
use replica_protocol::{CallbackId, ProxyMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

pub type UpdateListener = Arc<dyn Fn(Vec<RawEntity>) + Send + Sync>;
pub type SyncListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct HandleOptions {
    /// Applied to entities stored without an expiration.
    pub ttl: Ttl,
    pub time: Arc<dyn TimeSource>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            ttl: Ttl::Infinite,
            time: Arc::new(SystemTimeSource),
        }
    }
}

#[derive(Default)]
struct Listeners {
    update: Option<UpdateListener>,
    sync: Option<SyncListener>,
    desync: Option<SyncListener>,
}

pub struct Handle {
    actor: String,
    kind: CrdtKind,
    store: Arc<dyn ActiveStore>,
    model: Mutex<CrdtModel>,
    options: HandleOptions,
    callback_id: OnceLock<CallbackId>,
    synced: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
    queue: MessageQueue<ProxyMessage>,
    listeners: Mutex<Listeners>,
}

impl Handle {
    /// Subscribes to `store` and asks it for its model. `name` is the CRDT
    /// actor for this handle's writes.
    pub async fn open(
        name: impl Into<String>,
        store: Arc<dyn ActiveStore>,
        options: HandleOptions,
    ) -> StoreResult<Arc<Self>> {
        let kind = store.kind();
        if !matches!(kind, CrdtKind::Set | CrdtKind::Singleton) {
            return Err(StoreError::UnsupportedKind(kind));
        }

        let handle = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let queue = MessageQueue::new(Arc::new(move |message: ProxyMessage| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(handle) => handle.handle_message(message).await,
                        None => false,
                    }
                }) as BoxFuture<'static, bool>
            }));
            Self {
                actor: name.into(),
                kind,
                model: Mutex::new(CrdtModel::new(kind)),
                store,
                options,
                callback_id: OnceLock::new(),
                synced: AtomicBool::new(false),
                write_lock: tokio::sync::Mutex::new(()),
                queue,
                listeners: Mutex::new(Listeners::default()),
            }
        });

        let weak = Arc::downgrade(&handle);
        let id = handle
            .store
            .on(Arc::new(move |message| {
                if let Some(handle) = weak.upgrade() {
                    handle.deliver(message);
                }
            }))
            .await?;
        let _ = handle.callback_id.set(id);
        handle
            .store
            .on_proxy_message(ProxyMessage::sync_request(Some(id)))
            .await?;
        debug!(actor = %handle.actor, key = %handle.store.storage_key(), "Opened handle");
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.actor
    }

    pub fn kind(&self) -> CrdtKind {
        self.kind
    }

    pub fn storage_key(&self) -> &StorageKey {
        self.store.storage_key()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn on_update(&self, listener: impl Fn(Vec<RawEntity>) + Send + Sync + 'static) {
        self.listeners.lock().update = Some(Arc::new(listener));
    }

    pub fn on_sync(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().sync = Some(Arc::new(listener));
    }

    pub fn on_desync(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().desync = Some(Arc::new(listener));
    }

    /// Live entities. Expired ones are hidden until a cleanup pass removes
    /// them.
    pub fn fetch_all(&self) -> Vec<RawEntity> {
        let now = self.options.time.current_time_millis();
        self.fetch_all_unfiltered()
            .into_iter()
            .filter(|entity| !entity.is_expired(now))
            .collect()
    }

    /// The singleton value, or the first live entity of a collection.
    pub fn fetch(&self) -> Option<RawEntity> {
        self.fetch_all().into_iter().next()
    }

    /// Everything in the local model, expired or not.
    pub fn fetch_all_unfiltered(&self) -> Vec<RawEntity> {
        self.model.lock().entities()
    }

    /// Adds or replaces `entity`, stamping its creation time and, under a
    /// finite TTL, its expiration.
    pub async fn store(&self, entity: RawEntity) -> StoreResult<bool> {
        let entity = self.stamp(entity);
        self.write(|clock, actor| match self.kind {
            CrdtKind::Singleton => CrdtOperation::Singleton(SingletonOperation::Update {
                actor,
                clock: advanced(clock, &self.actor),
                value: entity.into(),
            }),
            _ => CrdtOperation::Set(SetOperation::Add {
                actor,
                clock: advanced(clock, &self.actor),
                added: entity.into(),
            }),
        })
        .await
    }

    pub async fn remove(&self, entity: &RawEntity) -> StoreResult<bool> {
        if self.kind == CrdtKind::Singleton {
            if self.fetch_all_unfiltered().iter().all(|current| current.id != entity.id) {
                return Ok(true);
            }
            return self.clear().await;
        }
        let removed = entity.clone();
        self.write(|clock, actor| {
            CrdtOperation::Set(SetOperation::Remove {
                actor,
                clock,
                removed: removed.into(),
            })
        })
        .await
    }

    pub async fn clear(&self) -> StoreResult<bool> {
        self.write(|clock, actor| match self.kind {
            CrdtKind::Singleton => CrdtOperation::Singleton(SingletonOperation::Clear { actor, clock }),
            _ => CrdtOperation::Set(SetOperation::Clear { actor, clock }),
        })
        .await
    }

    /// A reference to a stored entity. Reference-mode stores hand out
    /// references into their backing key.
    pub fn create_reference(&self, entity: &RawEntity, hard: bool) -> StoreResult<Reference> {
        let known = self
            .fetch_all_unfiltered()
            .iter()
            .any(|current| current.id == entity.id);
        if !known {
            return Err(StoreError::UnknownEntity(entity.id.clone()));
        }
        let reference = Reference::new(entity.id.clone(), self.entity_storage_key());
        Ok(if hard { reference.hard() } else { reference })
    }

    /// The key references to this handle's entities point into.
    pub fn entity_storage_key(&self) -> StorageKey {
        match self.store.storage_key() {
            StorageKey::ReferenceMode { backing, .. } => (**backing).clone(),
            other => other.clone(),
        }
    }

    /// Resolves once queued inbound messages and the store have settled.
    pub async fn idle(&self) {
        self.queue.idle().await;
        self.store.idle().await;
        self.queue.idle().await;
    }

    pub async fn close(&self) {
        if let Some(id) = self.callback_id.get() {
            let _ = self.store.off(*id).await;
        }
        self.queue.close();
        debug!(actor = %self.actor, "Closed handle");
    }

    pub(crate) fn deliver(&self, message: ProxyMessage) -> Receipt {
        self.queue.enqueue(message)
    }

    fn callback(&self) -> Option<CallbackId> {
        self.callback_id.get().copied()
    }

    fn stamp(&self, mut entity: RawEntity) -> RawEntity {
        let now = self.options.time.current_time_millis();
        if entity.creation_timestamp.is_none() {
            entity.creation_timestamp = Some(now);
        }
        if entity.expiration_timestamp.is_none() {
            entity.expiration_timestamp = self.options.ttl.calculate_expiration(now);
        }
        entity
    }

    /// Builds an operation against the current clock, applies it locally and
    /// sends it to the store.
    async fn write(&self, build: impl FnOnce(VersionMap, String) -> CrdtOperation) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let op = {
            let mut model = self.model.lock();
            let op = build(model.version_map().clone(), self.actor.clone());
            if !model.apply_operation(&op)? {
                warn!(actor = %self.actor, "Local operation rejected by own model");
                return Ok(false);
            }
            op
        };
        self.store
            .on_proxy_message(ProxyMessage::operations(vec![op], self.callback()))
            .await
    }

    async fn handle_message(&self, message: ProxyMessage) -> bool {
        match message {
            ProxyMessage::ModelUpdate { model, .. } => {
                let merged = {
                    let mut local = self.model.lock();
                    local.merge(&model).map(|changes| {
                        // The store's body wins for elements at the same
                        // version, e.g. a TTL kept from an earlier writer.
                        let adopted = local.adopt_values(&model);
                        !changes.model_change.is_empty() || adopted
                    })
                };
                let changed = match merged {
                    Ok(changed) => changed,
                    Err(e) => {
                        warn!(actor = %self.actor, error = %e, "Discarding malformed model update");
                        return false;
                    }
                };
                if !self.synced.swap(true, Ordering::SeqCst) {
                    self.notify_sync();
                } else if changed {
                    self.notify_update();
                }
                true
            }
            ProxyMessage::Operations { operations, .. } => {
                let applied = {
                    let mut model = self.model.lock();
                    let mut next = model.clone();
                    let applied = operations
                        .iter()
                        .all(|op| matches!(next.apply_operation(op), Ok(true)));
                    if applied {
                        *model = next;
                    }
                    applied
                };
                if !applied {
                    debug!(actor = %self.actor, "Operations out of order, resyncing");
                    self.synced.store(false, Ordering::SeqCst);
                    self.notify_desync();
                    self.send(ProxyMessage::sync_request(self.callback())).await;
                    return false;
                }
                if !operations.is_empty() {
                    self.notify_update();
                }
                true
            }
            ProxyMessage::SyncRequest { .. } => {
                let model = self.model.lock().data().clone();
                self.send(ProxyMessage::model_update(model, self.callback())).await
            }
        }
    }

    async fn send(&self, message: ProxyMessage) -> bool {
        match self.store.on_proxy_message(message).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(actor = %self.actor, error = %e, "Store rejected message");
                false
            }
        }
    }

    fn notify_update(&self) {
        let listener = self.listeners.lock().update.clone();
        if let Some(listener) = listener {
            listener(self.fetch_all());
        }
    }

    fn notify_sync(&self) {
        let listener = self.listeners.lock().sync.clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn notify_desync(&self) {
        let listener = self.listeners.lock().desync.clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

fn advanced(mut clock: VersionMap, actor: &str) -> VersionMap {
    clock.increment(actor);
    clock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStorage, RemovalManager, StoreManager};
    use replica_core::{FakeTimeSource, FieldValue};
    use std::sync::atomic::AtomicUsize;

    fn person(id: &str, name: &str) -> RawEntity {
        RawEntity::new(id).with_singleton("name", Some(FieldValue::text(name)))
    }

    fn names(entities: &[RawEntity]) -> Vec<String> {
        entities
            .iter()
            .filter_map(|e| e.singleton("name").and_then(|v| v.as_primitive()?.as_str().map(String::from)))
            .collect()
    }

    async fn open(manager: &StoreManager, key: &StorageKey, kind: CrdtKind, name: &str) -> Arc<Handle> {
        let store = manager.get(key, kind).await.unwrap();
        let handle = Handle::open(name, store, HandleOptions::default()).await.unwrap();
        handle.idle().await;
        handle
    }

    #[tokio::test]
    async fn test_writes_reach_other_handles() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let key = StorageKey::ramdisk("people");
        let alice = open(&manager, &key, CrdtKind::Set, "alice").await;
        let bob = open(&manager, &key, CrdtKind::Set, "bob").await;
        assert!(alice.is_synced() && bob.is_synced());

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        bob.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(alice.store(person("p1", "Ann")).await.unwrap());
        bob.idle().await;
        assert_eq!(names(&bob.fetch_all()), vec!["Ann"]);
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        assert!(bob.remove(&person("p1", "Ann")).await.unwrap());
        alice.idle().await;
        assert!(alice.fetch_all().is_empty());
    }

    #[tokio::test]
    async fn test_reference_mode_handles_see_whole_entities() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let key = StorageKey::reference_mode(StorageKey::ramdisk("people"), StorageKey::ramdisk("team"));
        let alice = open(&manager, &key, CrdtKind::Set, "alice").await;
        alice.store(person("p1", "Ann")).await.unwrap();
        alice.store(person("p2", "Bo")).await.unwrap();

        // A late joiner syncs through the container and backing stores.
        let bob = open(&manager, &key, CrdtKind::Set, "bob").await;
        assert_eq!(names(&bob.fetch_all()), vec!["Ann", "Bo"]);

        bob.store(person("p1", "Anna")).await.unwrap();
        alice.idle().await;
        assert_eq!(names(&alice.fetch_all()), vec!["Anna", "Bo"]);

        let reference = alice.create_reference(&person("p2", "Bo"), true).unwrap();
        assert_eq!(reference.storage_key, StorageKey::ramdisk("people"));
        assert!(reference.is_hard_reference);
        assert!(matches!(
            alice.create_reference(&RawEntity::new("nobody"), false),
            Err(StoreError::UnknownEntity(_))
        ));
    }

    async fn open_with_ttl(
        manager: &StoreManager,
        key: &StorageKey,
        name: &str,
        ttl: Ttl,
        time: &Arc<FakeTimeSource>,
    ) -> Arc<Handle> {
        let store = manager.get(key, CrdtKind::Set).await.unwrap();
        let options = HandleOptions {
            ttl,
            time: time.clone(),
        };
        let handle = Handle::open(name, store, options).await.unwrap();
        handle.idle().await;
        handle
    }

    fn shared_backing(collection: &str) -> StorageKey {
        StorageKey::reference_mode(StorageKey::ramdisk("people"), StorageKey::ramdisk(collection))
    }

    #[tokio::test]
    async fn test_removal_leaves_entity_to_other_collections() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let h1 = open(&manager, &shared_backing("first"), CrdtKind::Set, "h1").await;
        let h2 = open(&manager, &shared_backing("second"), CrdtKind::Set, "h2").await;
        h1.store(person("e1", "Ann")).await.unwrap();
        h2.store(person("e1", "Ann")).await.unwrap();

        h1.remove(&person("e1", "Ann")).await.unwrap();
        h1.idle().await;
        h2.idle().await;
        assert!(h1.fetch_all().is_empty());
        assert_eq!(names(&h2.fetch_all()), vec!["Ann"]);

        let fresh = open(&manager, &shared_backing("second"), CrdtKind::Set, "h3").await;
        assert_eq!(names(&fresh.fetch_all()), vec!["Ann"]);
    }

    #[tokio::test]
    async fn test_first_ttl_sticks_across_collections() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let time = Arc::new(FakeTimeSource::new(10_000));
        let h1 = open_with_ttl(&manager, &shared_backing("first"), "h1", Ttl::Minutes(1), &time).await;
        let h2 = open_with_ttl(&manager, &shared_backing("second"), "h2", Ttl::Minutes(2), &time).await;

        h1.store(person("e1", "Ann")).await.unwrap();
        h2.store(person("e1", "Ann")).await.unwrap();
        h2.store(person("e4", "Di")).await.unwrap();
        h1.store(person("e4", "Di")).await.unwrap();
        h1.idle().await;
        h2.idle().await;

        time.advance(90_000);
        // e1 keeps the one minute TTL it was first stored with, e4 two.
        assert_eq!(names(&h1.fetch_all()), vec!["Di"]);
        assert_eq!(names(&h2.fetch_all()), vec!["Di"]);
        let fresh = open_with_ttl(&manager, &shared_backing("second"), "h3", Ttl::Minutes(2), &time).await;
        assert_eq!(names(&fresh.fetch_all()), vec!["Di"]);

        let removal = RemovalManager::new(time.clone());
        assert_eq!(removal.remove_expired(&h2).await.removed, 1);
        fresh.idle().await;
        let left: Vec<String> = fresh.fetch_all_unfiltered().into_iter().map(|e| e.id).collect();
        assert_eq!(left, vec!["e4"]);
    }

    #[tokio::test]
    async fn test_singleton_keeps_latest_value() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let key = StorageKey::ramdisk("current");
        let handle = open(&manager, &key, CrdtKind::Singleton, "alice").await;
        handle.store(person("p1", "Ann")).await.unwrap();
        handle.store(person("p2", "Bo")).await.unwrap();
        assert_eq!(handle.fetch().map(|e| e.id), Some("p2".to_string()));

        // Removing something that isn't current is a no-op.
        assert!(handle.remove(&person("p1", "Ann")).await.unwrap());
        assert!(handle.fetch().is_some());
        assert!(handle.remove(&person("p2", "Bo")).await.unwrap());
        assert!(handle.fetch().is_none());
    }

    #[tokio::test]
    async fn test_ttl_hides_expired_entities() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let time = Arc::new(FakeTimeSource::new(10_000));
        let store = manager.get(&StorageKey::ramdisk("ttl"), CrdtKind::Set).await.unwrap();
        let options = HandleOptions {
            ttl: Ttl::Minutes(1),
            time: time.clone(),
        };
        let handle = Handle::open("alice", store, options).await.unwrap();
        handle.store(person("p1", "Ann")).await.unwrap();

        let stored = handle.fetch_all();
        assert_eq!(stored[0].creation_timestamp, Some(10_000));
        assert_eq!(stored[0].expiration_timestamp, Some(70_000));

        time.advance(60_001);
        assert!(handle.fetch_all().is_empty());
        assert_eq!(handle.fetch_all_unfiltered().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_operations_trigger_resync() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let key = StorageKey::ramdisk("gap");
        let handle = open(&manager, &key, CrdtKind::Set, "alice").await;
        let syncs = Arc::new(AtomicUsize::new(0));
        let desyncs = Arc::new(AtomicUsize::new(0));
        let (s, d) = (syncs.clone(), desyncs.clone());
        handle.on_sync(move || {
            s.fetch_add(1, Ordering::SeqCst);
        });
        handle.on_desync(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        let gap = CrdtOperation::Set(SetOperation::Add {
            actor: "zed".into(),
            clock: VersionMap::from_entries([("zed", 2)]),
            added: person("p9", "Zed").into(),
        });
        assert!(!handle.deliver(ProxyMessage::operations(vec![gap], None)).await);
        handle.idle().await;

        assert_eq!(desyncs.load(Ordering::SeqCst), 1);
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
        assert!(handle.is_synced());
        assert!(handle.fetch_all().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_collection_stores() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let store = manager.get(&StorageKey::ramdisk("n"), CrdtKind::Count).await.unwrap();
        assert!(matches!(
            Handle::open("alice", store, HandleOptions::default()).await,
            Err(StoreError::UnsupportedKind(CrdtKind::Count))
        ));
    }
}
