//! Reference-mode store
//!
//! Proxies see a collection (or singleton) of whole entities. Underneath,
//! the collection is kept as references in a container [`DirectStore`] and
//! every entity lives in its own backing store:
//!
//! ```text
//!   proxies ──► MessageQueue ──► backing/<id>  (entity CRDT, written first)
//!      ▲              │     └──► container      (references)
//!      └── SendQueue ◄┘
//! ```
//!
//! Proxy, container and backing traffic all pass through one
//! [`MessageQueue`], so they are handled in a single total order. Outbound
//! messages go through a [`SendQueue`] and are held back while a referenced
//! entity version is not yet in the backing store.

use crate::backing::BackingStore;
use crate::direct::{DirectStore, DirectStores};
use crate::error::{StoreError, StoreResult};
use crate::message_queue::MessageQueue;
use crate::send_queue::SendQueue;
use crate::store::ActiveStore;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use replica_core::crdt::{EntityData, SetData, SetElement, SetOperation, SingletonOperation};
use replica_core::{
    CrdtData, CrdtError, CrdtKind, CrdtOperation, FieldName, FieldValue, RawEntity, Referencable,
    Reference, ReferenceId, StorageKey, VersionMap,
};
use replica_protocol::{CallbackId, CallbackManager, ProxyCallback, ProxyMessage};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

enum Inbound {
    Proxy {
        message: ProxyMessage,
        error: oneshot::Sender<StoreError>,
    },
    Container(ProxyMessage),
    Backing(ReferenceId, ProxyMessage),
    Release(ReferenceId),
}

/// Counters this store has written under its own actor key.
#[derive(Default)]
struct EntityVersions {
    entity: u64,
    fields: HashMap<FieldName, u64>,
}

pub struct ReferenceModeStore {
    key: StorageKey,
    kind: CrdtKind,
    /// Actor for entity writes synthesized by this store.
    crdt_key: String,
    weak: Weak<ReferenceModeStore>,
    container: Arc<DirectStore>,
    container_callback: OnceLock<CallbackId>,
    backing: BackingStore,
    callbacks: Arc<CallbackManager>,
    send_queue: SendQueue,
    queue: MessageQueue<Inbound>,
    versions: Mutex<HashMap<ReferenceId, EntityVersions>>,
}

impl ReferenceModeStore {
    /// Opens the store at a `reference-mode://` key. `kind` is the
    /// proxy-facing kind: a set or a singleton.
    pub async fn open(key: StorageKey, kind: CrdtKind, stores: DirectStores) -> StoreResult<Arc<Self>> {
        let (backing_key, container_key) = match &key {
            StorageKey::ReferenceMode { backing, storage } => ((**backing).clone(), (**storage).clone()),
            other => return Err(StoreError::UnsupportedKey(other.to_string())),
        };
        if !matches!(kind, CrdtKind::Set | CrdtKind::Singleton) {
            return Err(StoreError::UnsupportedKind(kind));
        }

        let container = stores.open(&container_key, kind).await?;
        let store = Arc::new_cyclic(|weak: &Weak<Self>| {
            let backing_weak = weak.clone();
            let backing = BackingStore::new(
                backing_key,
                stores,
                Arc::new(move |id, message| {
                    if let Some(store) = backing_weak.upgrade() {
                        store.queue.enqueue(Inbound::Backing(id, message));
                    }
                }),
            );

            let handler_weak = weak.clone();
            let queue = MessageQueue::new(Arc::new(move |inbound: Inbound| {
                let weak = handler_weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(store) => store.handle(inbound).await,
                        None => false,
                    }
                }) as BoxFuture<'static, bool>
            }));

            Self {
                key,
                kind,
                crdt_key: uuid::Uuid::new_v4().to_string(),
                weak: weak.clone(),
                container,
                container_callback: OnceLock::new(),
                backing,
                callbacks: Arc::new(CallbackManager::new()),
                send_queue: SendQueue::new(),
                queue,
                versions: Mutex::new(HashMap::new()),
            }
        });

        let weak = Arc::downgrade(&store);
        let container_callback = store
            .container
            .on(Arc::new(move |message| {
                if let Some(store) = weak.upgrade() {
                    store.queue.enqueue(Inbound::Container(message));
                }
            }))
            .await?;
        let _ = store.container_callback.set(container_callback);

        info!(key = %store.key, kind = %kind, actor = %store.crdt_key, "Opened reference-mode store");
        Ok(store)
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    pub fn container(&self) -> &Arc<DirectStore> {
        &self.container
    }

    /// Stops tracking the backing entity `id` unless the container
    /// references it. Runs in order with proxy traffic, so a write that
    /// re-adds `id` either lands first and keeps it or reopens the store.
    pub async fn release_backing(&self, id: &str) -> bool {
        if self.queue.is_closed() {
            return false;
        }
        self.queue.enqueue(Inbound::Release(id.to_string())).await
    }

    /// Ids the container currently references.
    pub fn referenced_ids(&self) -> BTreeSet<ReferenceId> {
        self.container
            .local_data()
            .as_collection()
            .map(|data| data.values.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The proxy-facing model: container references resolved against the
    /// backing stores as they are now.
    pub async fn get_local_data(&self) -> StoreResult<CrdtData> {
        let container = self.container.local_data();
        self.pending_holds(&container).await?;
        Ok(self.entity_model(&container))
    }

    fn container_id(&self) -> Option<CallbackId> {
        self.container_callback.get().copied()
    }

    async fn handle(&self, inbound: Inbound) -> bool {
        match inbound {
            Inbound::Proxy { message, error } => match self.handle_proxy_message(message).await {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Rejected proxy message");
                    let _ = error.send(e);
                    false
                }
            },
            Inbound::Container(message) => match self.handle_container_message(message).await {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to relay container message");
                    false
                }
            },
            Inbound::Backing(id, message) => {
                self.handle_backing_message(&id, message);
                true
            }
            Inbound::Release(id) => {
                if self.referenced_ids().contains(&id) {
                    return false;
                }
                self.versions.lock().remove(&id);
                match self.backing.release(&id).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(key = %self.key, id = %id, error = %e, "Failed to release backing entity");
                        false
                    }
                }
            }
        }
    }

    async fn handle_proxy_message(&self, message: ProxyMessage) -> StoreResult<bool> {
        match message {
            ProxyMessage::SyncRequest { id } => {
                let container = self.container.local_data();
                let holds = self.pending_holds(&container).await?;
                let weak = self.weak.clone();
                self.send_queue.enqueue(holds, move || {
                    if let Some(store) = weak.upgrade() {
                        let reply = ProxyMessage::model_update(store.entity_model(&container), id);
                        match id {
                            Some(id) => {
                                store.callbacks.send_to(id, reply);
                            }
                            None => store.callbacks.send(reply),
                        }
                    }
                });
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                let mut container_ops = Vec::with_capacity(operations.len());
                for op in &operations {
                    container_ops.push(self.to_container_op(op).await?);
                }

                let applied = self
                    .container
                    .on_proxy_message(ProxyMessage::operations(container_ops, self.container_id()))
                    .await?;
                if !applied {
                    debug!(key = %self.key, source = ?id, "Container rejected operations");
                    return Ok(false);
                }

                // Other proxies see entities as the backing holds them, which
                // may keep timestamps from an earlier writer.
                let resolved: Vec<CrdtOperation> = operations
                    .iter()
                    .filter_map(|op| map_op_values(op, |value| Some(self.backed_value(value)), FieldValue::clone))
                    .collect();
                let corrected = operations
                    .iter()
                    .flat_map(added_values)
                    .ne(resolved.iter().flat_map(added_values));

                let callbacks = self.callbacks.clone();
                let echo = ProxyMessage::operations(resolved, id);
                self.send_queue
                    .enqueue_unblocked(move || callbacks.send_except(echo, id));

                if let (true, Some(source)) = (corrected, id) {
                    let container = self.container.local_data();
                    let holds = self.pending_holds(&container).await?;
                    let weak = self.weak.clone();
                    self.send_queue.enqueue(holds, move || {
                        if let Some(store) = weak.upgrade() {
                            let reply = ProxyMessage::model_update(store.entity_model(&container), id);
                            store.callbacks.send_to(source, reply);
                        }
                    });
                }
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                if model.kind() != self.kind {
                    return Err(StoreError::KindMismatch {
                        expected: self.kind,
                        got: model.kind(),
                    });
                }
                let container_model = self.to_container_model(&model).await?;
                self.container
                    .on_proxy_message(ProxyMessage::model_update(container_model.clone(), self.container_id()))
                    .await?;

                // The sender gets it too, in case the backing kept values
                // other than the ones it sent.
                let holds = self.pending_holds(&container_model).await?;
                let weak = self.weak.clone();
                self.send_queue.enqueue(holds, move || {
                    if let Some(store) = weak.upgrade() {
                        let echo = ProxyMessage::model_update(store.entity_model(&container_model), id);
                        store.callbacks.send(echo);
                    }
                });
                Ok(true)
            }
        }
    }

    async fn handle_container_message(&self, message: ProxyMessage) -> StoreResult<bool> {
        match message {
            ProxyMessage::SyncRequest { .. } => {
                let callbacks = self.callbacks.clone();
                self.send_queue
                    .enqueue_unblocked(move || callbacks.send(ProxyMessage::sync_request(None)));
            }
            ProxyMessage::Operations { operations, .. } => {
                let mut holds = Vec::new();
                for op in &operations {
                    for reference in op_references(op) {
                        if !self.backing_covers(reference).await? {
                            holds.push((reference.id.clone(), reference.version.clone()));
                        }
                    }
                }
                let weak = self.weak.clone();
                self.send_queue.enqueue(holds, move || {
                    if let Some(store) = weak.upgrade() {
                        let ops = operations
                            .iter()
                            .filter_map(|op| {
                                map_op_values(op, |value| store.entity_value(value), |value| store.removal_value(value))
                            })
                            .collect();
                        store.callbacks.send(ProxyMessage::operations(ops, None));
                    }
                });
            }
            ProxyMessage::ModelUpdate { model, .. } => {
                let holds = self.pending_holds(&model).await?;
                let weak = self.weak.clone();
                self.send_queue.enqueue(holds, move || {
                    if let Some(store) = weak.upgrade() {
                        let update = ProxyMessage::model_update(store.entity_model(&model), None);
                        store.callbacks.send(update);
                    }
                });
            }
        }
        Ok(true)
    }

    fn handle_backing_message(&self, id: &str, message: ProxyMessage) {
        if let ProxyMessage::SyncRequest { .. } = message {
            debug!(key = %self.key, id, "Ignoring backing sync request");
            return;
        }
        if let Some(version) = self.backing.version_of(id) {
            self.send_queue.notify_reference_hold(id, &version);
        }
    }

    async fn to_container_op(&self, op: &CrdtOperation) -> StoreResult<CrdtOperation> {
        let translated = match (self.kind, op) {
            (CrdtKind::Set, CrdtOperation::Set(set_op)) => CrdtOperation::Set(match set_op {
                SetOperation::Add { actor, clock, added } => SetOperation::Add {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    added: self.write_value(added).await?,
                },
                SetOperation::Remove { actor, clock, removed } => SetOperation::Remove {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    removed: self.reference_to(removed),
                },
                SetOperation::Clear { actor, clock } => SetOperation::Clear {
                    actor: actor.clone(),
                    clock: clock.clone(),
                },
                SetOperation::FastForward {
                    old_clock,
                    new_clock,
                    added,
                    removed,
                } => {
                    let mut references = Vec::with_capacity(added.len());
                    for element in added {
                        let value = self.write_value(&element.value).await?;
                        references.push(SetElement::new(element.version_map.clone(), value));
                    }
                    SetOperation::FastForward {
                        old_clock: old_clock.clone(),
                        new_clock: new_clock.clone(),
                        added: references,
                        removed: removed.iter().map(|value| self.reference_to(value)).collect(),
                    }
                }
            }),
            (CrdtKind::Singleton, CrdtOperation::Singleton(singleton_op)) => {
                CrdtOperation::Singleton(match singleton_op {
                    SingletonOperation::Update { actor, clock, value } => SingletonOperation::Update {
                        actor: actor.clone(),
                        clock: clock.clone(),
                        value: self.write_value(value).await?,
                    },
                    SingletonOperation::Clear { actor, clock } => SingletonOperation::Clear {
                        actor: actor.clone(),
                        clock: clock.clone(),
                    },
                })
            }
            (kind, other) => {
                return Err(CrdtError::TypeMismatch {
                    expected: kind.to_string(),
                    got: other.kind().to_string(),
                }
                .into())
            }
        };
        Ok(translated)
    }

    async fn to_container_model(&self, model: &CrdtData) -> StoreResult<CrdtData> {
        let data = model.as_collection().ok_or(StoreError::KindMismatch {
            expected: self.kind,
            got: model.kind(),
        })?;
        let mut values = BTreeMap::new();
        for (id, element) in &data.values {
            let value = self.write_value(&element.value).await?;
            values.insert(id.clone(), SetElement::new(element.version_map.clone(), value));
        }
        let references = SetData {
            version_map: data.version_map.clone(),
            values,
        };
        Ok(match self.kind {
            CrdtKind::Singleton => CrdtData::Singleton(references),
            _ => CrdtData::Set(references),
        })
    }

    /// Writes inline entities to the backing store, returning the value to
    /// keep in the container.
    async fn write_value(&self, value: &FieldValue) -> StoreResult<FieldValue> {
        match value {
            FieldValue::Entity(entity) => Ok(FieldValue::Reference(self.write_entity(entity).await?)),
            other => Ok(other.clone()),
        }
    }

    async fn write_entity(&self, entity: &RawEntity) -> StoreResult<Reference> {
        let store = self.backing.store_for(&entity.id).await?;
        let current = match store.local_data() {
            CrdtData::Entity(data) => data,
            _ => EntityData::default(),
        };
        let data = self.stamp_entity(entity, &current);
        self.backing
            .on_proxy_message(&entity.id, ProxyMessage::model_update(CrdtData::Entity(data), None))
            .await?;

        let version = store.version_map();
        self.send_queue.notify_reference_hold(&entity.id, &version);
        Ok(Reference::new(entity.id.clone(), self.backing.storage_key().clone()).with_version(version))
    }

    /// Entity data holding only the fields of `entity` that differ from
    /// `current`, each at a version that dominates the one it replaces.
    /// An expiration already on the backing entity is kept.
    fn stamp_entity(&self, entity: &RawEntity, current: &EntityData) -> EntityData {
        let current_raw = current.to_raw_entity();
        let creation = current
            .creation_timestamp
            .into_iter()
            .chain(entity.creation_timestamp)
            .min();
        let expiration = current.expiration_timestamp.or(entity.expiration_timestamp);
        let mut versions = self.versions.lock();
        let counters = versions.entry(entity.id.clone()).or_default();
        let mut dirty = current.id.is_empty()
            || current.creation_timestamp != creation
            || current.expiration_timestamp != expiration;

        let mut bump = |field: &str, base: Option<&VersionMap>| -> VersionMap {
            let mut version = base.cloned().unwrap_or_default();
            let counter = counters.fields.entry(field.to_string()).or_insert(0);
            *counter = (*counter).max(version.get(&self.crdt_key)) + 1;
            version.set(self.crdt_key.clone(), *counter);
            version
        };

        let mut singletons = BTreeMap::new();
        for (field, value) in &entity.singletons {
            let existing = current.singletons.get(field);
            if existing.is_some() && current_raw.singletons.get(field) == Some(value) {
                continue;
            }
            let version = bump(field, existing.map(|data| &data.version_map));
            singletons.insert(field.clone(), SetData::with_values(version, value.clone()));
        }

        let mut collections = BTreeMap::new();
        for (field, values) in &entity.collections {
            let existing = current.collections.get(field);
            let wanted: BTreeMap<ReferenceId, &FieldValue> = values.iter().map(|v| (v.id(), v)).collect();
            let unchanged = existing.is_some_and(|data| {
                data.values.len() == wanted.len()
                    && data
                        .values
                        .iter()
                        .all(|(id, element)| wanted.get(id) == Some(&&element.value))
            });
            if unchanged {
                continue;
            }
            let version = bump(field, existing.map(|data| &data.version_map));
            collections.insert(field.clone(), SetData::with_values(version, values.iter().cloned()));
        }

        let mut version = current.version_map.clone();
        for data in singletons.values().chain(collections.values()) {
            version.merge_in(&data.version_map);
        }
        dirty |= !singletons.is_empty() || !collections.is_empty();
        if dirty {
            counters.entity = counters.entity.max(version.get(&self.crdt_key)) + 1;
            version.set(self.crdt_key.clone(), counters.entity);
        }

        EntityData {
            version_map: version,
            id: entity.id.clone(),
            creation_timestamp: creation,
            expiration_timestamp: expiration,
            singletons,
            collections,
        }
    }

    fn reference_to(&self, value: &FieldValue) -> FieldValue {
        match value {
            FieldValue::Entity(entity) => {
                FieldValue::Reference(Reference::new(entity.id.clone(), self.backing.storage_key().clone()))
            }
            other => other.clone(),
        }
    }

    async fn backing_covers(&self, reference: &Reference) -> StoreResult<bool> {
        let store = self.backing.store_for(&reference.id).await?;
        Ok(store.version_map().dominates_or_equals(&reference.version))
    }

    /// Opens the backing store of every reference in `model` and returns
    /// the ones not yet at the referenced version.
    async fn pending_holds(&self, model: &CrdtData) -> StoreResult<Vec<(ReferenceId, VersionMap)>> {
        let mut holds = Vec::new();
        if let Some(data) = model.as_collection() {
            for element in data.values.values() {
                if let FieldValue::Reference(reference) = &element.value {
                    if !self.backing_covers(reference).await? {
                        holds.push((reference.id.clone(), reference.version.clone()));
                    }
                }
            }
        }
        Ok(holds)
    }

    /// The backing entity behind `id`, if it holds any data.
    fn backed_entity(&self, id: &str) -> Option<RawEntity> {
        let data = self.backing.entity(id).filter(|data| !data.version_map.is_empty())?;
        let mut entity = data.to_raw_entity();
        entity.id = id.to_string();
        Some(entity)
    }

    /// Resolves a container reference to the entity it names.
    fn entity_value(&self, value: &FieldValue) -> Option<FieldValue> {
        match value {
            FieldValue::Reference(reference) => match self.backed_entity(&reference.id) {
                Some(entity) => Some(entity.into()),
                None => {
                    warn!(key = %self.key, id = %reference.id, "Referenced entity missing from backing store, skipping");
                    None
                }
            },
            other => Some(other.clone()),
        }
    }

    /// Removals only need the id, so a missing backing entity is not an
    /// error here.
    fn removal_value(&self, value: &FieldValue) -> FieldValue {
        match value {
            FieldValue::Reference(reference) => self
                .backed_entity(&reference.id)
                .unwrap_or_else(|| RawEntity::new(reference.id.clone()))
                .into(),
            other => other.clone(),
        }
    }

    /// An inline entity replaced by what the backing store holds for it.
    fn backed_value(&self, value: &FieldValue) -> FieldValue {
        match value {
            FieldValue::Entity(entity) => self
                .backed_entity(&entity.id)
                .map(FieldValue::from)
                .unwrap_or_else(|| value.clone()),
            other => other.clone(),
        }
    }

    fn entity_model(&self, container: &CrdtData) -> CrdtData {
        let map = |data: &SetData<FieldValue>| SetData {
            version_map: data.version_map.clone(),
            values: data
                .values
                .iter()
                .filter_map(|(id, element)| {
                    let value = self.entity_value(&element.value)?;
                    Some((id.clone(), SetElement::new(element.version_map.clone(), value)))
                })
                .collect(),
        };
        match container {
            CrdtData::Set(data) => CrdtData::Set(map(data)),
            CrdtData::Singleton(data) => CrdtData::Singleton(map(data)),
            other => other.clone(),
        }
    }
}

/// Values an operation adds or updates.
fn added_values(op: &CrdtOperation) -> Vec<&FieldValue> {
    match op {
        CrdtOperation::Set(SetOperation::Add { added, .. }) => vec![added],
        CrdtOperation::Set(SetOperation::FastForward { added, .. }) => added.iter().map(|e| &e.value).collect(),
        CrdtOperation::Singleton(SingletonOperation::Update { value, .. }) => vec![value],
        _ => Vec::new(),
    }
}

fn op_references(op: &CrdtOperation) -> Vec<&Reference> {
    added_values(op)
        .into_iter()
        .filter_map(FieldValue::as_reference)
        .collect()
}

/// Maps added values with `added` and removed ones with `removed`. An add
/// or update whose value maps to `None` drops the whole operation.
fn map_op_values(
    op: &CrdtOperation,
    added: impl Fn(&FieldValue) -> Option<FieldValue>,
    removed: impl Fn(&FieldValue) -> FieldValue,
) -> Option<CrdtOperation> {
    let mapped = match op {
        CrdtOperation::Set(set_op) => CrdtOperation::Set(match set_op {
            SetOperation::Add {
                actor,
                clock,
                added: value,
            } => SetOperation::Add {
                actor: actor.clone(),
                clock: clock.clone(),
                added: added(value)?,
            },
            SetOperation::Remove {
                actor,
                clock,
                removed: value,
            } => SetOperation::Remove {
                actor: actor.clone(),
                clock: clock.clone(),
                removed: removed(value),
            },
            SetOperation::Clear { actor, clock } => SetOperation::Clear {
                actor: actor.clone(),
                clock: clock.clone(),
            },
            SetOperation::FastForward {
                old_clock,
                new_clock,
                added: elements,
                removed: values,
            } => SetOperation::FastForward {
                old_clock: old_clock.clone(),
                new_clock: new_clock.clone(),
                added: elements
                    .iter()
                    .filter_map(|e| Some(SetElement::new(e.version_map.clone(), added(&e.value)?)))
                    .collect(),
                removed: values.iter().map(&removed).collect(),
            },
        }),
        CrdtOperation::Singleton(SingletonOperation::Update { actor, clock, value }) => {
            CrdtOperation::Singleton(SingletonOperation::Update {
                actor: actor.clone(),
                clock: clock.clone(),
                value: added(value)?,
            })
        }
        other => other.clone(),
    };
    Some(mapped)
}

#[async_trait]
impl ActiveStore for ReferenceModeStore {
    fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    fn kind(&self) -> CrdtKind {
        self.kind
    }

    async fn on(&self, callback: ProxyCallback) -> StoreResult<CallbackId> {
        if self.queue.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(self.callbacks.register(callback))
    }

    async fn off(&self, id: CallbackId) -> StoreResult<()> {
        self.callbacks.unregister(id);
        Ok(())
    }

    async fn on_proxy_message(&self, message: ProxyMessage) -> StoreResult<bool> {
        if self.queue.is_closed() {
            return Err(StoreError::Closed);
        }
        let (error, mut failure) = oneshot::channel();
        let applied = self.queue.enqueue(Inbound::Proxy { message, error }).await;
        match failure.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(applied),
        }
    }

    async fn idle(&self) {
        self.queue.idle().await;
        self.container.idle().await;
    }

    async fn close(&self) {
        self.queue.close();
        if let Some(id) = self.container_id() {
            let _ = self.container.off(id).await;
        }
        self.backing.close().await;
        self.send_queue.clear();
        self.callbacks.clear();
        info!(key = %self.key, "Closed reference-mode store");
    }
}
