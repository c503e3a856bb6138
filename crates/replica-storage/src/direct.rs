//! Direct store: one CRDT model, its subscribers and its persisted copy

use crate::error::{StoreError, StoreResult};
use crate::store::ActiveStore;
use crate::{RecordMeta, Storage};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use replica_core::{CrdtChange, CrdtData, CrdtKind, CrdtModel, StorageKey, VersionMap};
use replica_protocol::{CallbackId, CallbackManager, ProxyCallback, ProxyMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DirectStore {
    key: StorageKey,
    kind: CrdtKind,
    model: Mutex<CrdtModel>,
    callbacks: CallbackManager,
    storage: Arc<dyn Storage>,
    /// Serializes writes to `storage` so snapshots land in order.
    persist_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl DirectStore {
    /// Opens the store at `key`, reloading any persisted model.
    pub async fn open(key: StorageKey, kind: CrdtKind, storage: Arc<dyn Storage>) -> StoreResult<Self> {
        let model = match storage.load(&key).await? {
            Some((meta, bytes)) => {
                if meta.kind != kind {
                    return Err(StoreError::KindMismatch {
                        expected: kind,
                        got: meta.kind,
                    });
                }
                let data: CrdtData = serde_json::from_slice(&bytes)?;
                debug!(key = %key, version = %meta.version, "Loaded persisted model");
                CrdtModel::from_data(data)
            }
            None => CrdtModel::new(kind),
        };

        Ok(Self {
            key,
            kind,
            model: Mutex::new(model),
            callbacks: CallbackManager::new(),
            storage,
            persist_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_data(&self) -> CrdtData {
        self.model.lock().data().clone()
    }

    pub fn version_map(&self) -> VersionMap {
        self.model.lock().version_map().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.len()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn persist(&self) -> StoreResult<()> {
        let _guard = self.persist_lock.lock().await;
        // Snapshot under the guard so a later write never loses to an
        // earlier one.
        let (bytes, version) = {
            let model = self.model.lock();
            (serde_json::to_vec(model.data())?, model.version_map().clone())
        };
        self.storage
            .store(&self.key, &RecordMeta::new(self.kind, version), &bytes)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ActiveStore for DirectStore {
    fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    fn kind(&self) -> CrdtKind {
        self.kind
    }

    async fn on(&self, callback: ProxyCallback) -> StoreResult<CallbackId> {
        self.ensure_open()?;
        Ok(self.callbacks.register(callback))
    }

    async fn off(&self, id: CallbackId) -> StoreResult<()> {
        self.callbacks.unregister(id);
        Ok(())
    }

    async fn on_proxy_message(&self, message: ProxyMessage) -> StoreResult<bool> {
        self.ensure_open()?;
        match message {
            ProxyMessage::SyncRequest { id } => {
                let reply = ProxyMessage::model_update(self.local_data(), id);
                match id {
                    Some(id) => {
                        self.callbacks.send_to(id, reply);
                    }
                    None => self.callbacks.send(reply),
                }
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                let applied = {
                    let mut model = self.model.lock();
                    let mut candidate = model.clone();
                    let mut applied = true;
                    for op in &operations {
                        if !candidate.apply_operation(op)? {
                            applied = false;
                            break;
                        }
                    }
                    if applied {
                        *model = candidate;
                    }
                    applied
                };

                if !applied {
                    debug!(key = %self.key, source = ?id, "Operations out of order, requesting sync");
                    if let Some(id) = id {
                        self.callbacks.send_to(id, ProxyMessage::sync_request(Some(id)));
                    }
                    return Ok(false);
                }
                if operations.is_empty() {
                    return Ok(true);
                }

                self.persist().await?;
                self.callbacks
                    .send_except(ProxyMessage::operations(operations, id), id);
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let changes = self.model.lock().merge(&model)?;
                if changes.model_change.is_empty() {
                    return Ok(true);
                }

                self.persist().await?;
                let outgoing = match changes.model_change {
                    CrdtChange::Operations(ops) => ProxyMessage::operations(ops, id),
                    CrdtChange::Data(data) => ProxyMessage::model_update(data, id),
                };
                self.callbacks.send_except(outgoing, id);
                Ok(true)
            }
        }
    }

    async fn idle(&self) {
        let _guard = self.persist_lock.lock().await;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.callbacks.clear();
    }
}

/// Shared cache of open direct stores over one backend.
///
/// Container and backing stores are looked up here so that every reader of
/// a key observes the same live model.
#[derive(Clone)]
pub struct DirectStores {
    stores: Arc<DashMap<String, Arc<DirectStore>>>,
    storage: Arc<dyn Storage>,
}

impl DirectStores {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            stores: Arc::new(DashMap::new()),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Get or open the store at `key`.
    pub async fn open(&self, key: &StorageKey, kind: CrdtKind) -> StoreResult<Arc<DirectStore>> {
        let text = key.to_string();
        if let Some(store) = self.stores.get(&text) {
            if store.kind() != kind {
                return Err(StoreError::KindMismatch {
                    expected: kind,
                    got: store.kind(),
                });
            }
            return Ok(store.value().clone());
        }

        let store = Arc::new(DirectStore::open(key.clone(), kind, self.storage.clone()).await?);
        Ok(self.stores.entry(text).or_insert(store).value().clone())
    }

    pub fn get(&self, key: &StorageKey) -> Option<Arc<DirectStore>> {
        self.stores.get(&key.to_string()).map(|s| s.value().clone())
    }

    /// Drops the cached store and its persisted record.
    pub async fn purge(&self, key: &StorageKey) -> StoreResult<bool> {
        if let Some((_, store)) = self.stores.remove(&key.to_string()) {
            if store.subscriber_count() > 0 {
                warn!(key = %key, subscribers = store.subscriber_count(), "Purging store with live subscribers");
            }
            store.close().await;
        }
        Ok(self.storage.delete(key).await?)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub async fn close_all(&self) {
        let stores: Vec<Arc<DirectStore>> = self.stores.iter().map(|s| s.value().clone()).collect();
        self.stores.clear();
        for store in stores {
            store.close().await;
        }
    }
}
