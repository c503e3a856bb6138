//! A store living on the other side of a [`Channel`]

use crate::channel::Channel;
use crate::error::ChannelResult;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use replica_core::{CrdtKind, StorageKey};
use replica_protocol::{CallbackId, CallbackManager, ProxyCallback, ProxyMessage, Token};
use replica_storage::{ActiveStore, StoreError, StoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Proxies an [`ActiveStore`] over one remote callback registration.
///
/// Local subscribers share the registration: pushes from the remote store
/// go to all of them, and accepted local writes are echoed to the other
/// local subscribers since the remote side sees them as one.
pub struct RemoteStore {
    key: StorageKey,
    kind: CrdtKind,
    channel: Arc<Channel>,
    token: Token,
    callbacks: Arc<CallbackManager>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RemoteStore {
    pub async fn open(channel: Arc<Channel>, key: StorageKey, kind: CrdtKind) -> ChannelResult<Arc<Self>> {
        let token = channel.register_callback(key.clone(), kind).await?;
        let callbacks = Arc::new(CallbackManager::new());

        let mut pushes = channel.subscribe(token);
        let fanout = callbacks.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = pushes.next().await {
                fanout.send(message);
            }
        });

        debug!(key = %key, token, "Opened remote store");
        Ok(Arc::new(Self {
            key,
            kind,
            channel,
            token,
            callbacks,
            forwarder: Mutex::new(Some(forwarder)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn token(&self) -> Token {
        self.token
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) || self.channel.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl ActiveStore for RemoteStore {
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
        let source = message.id();
        let echo = match &message {
            ProxyMessage::SyncRequest { .. } => None,
            other => Some(other.clone()),
        };
        let applied = self.channel.send_proxy_message(self.token, message).await?;
        if let (true, Some(echo)) = (applied, echo) {
            self.callbacks.send_except(echo, source);
        }
        Ok(applied)
    }

    async fn idle(&self) {
        self.channel.flush().await;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.channel.unregister_callback(self.token).await {
            debug!(key = %self.key, error = %e, "Remote unregister failed");
        }
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        self.callbacks.clear();
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::StorageService;
    use replica_core::{FieldValue, RawEntity};
    use replica_storage::{Handle, HandleOptions, MemoryStorage, StoreManager};
    use std::time::Duration;

    fn served(manager: &StoreManager) -> Arc<Channel> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let service = StorageService::new(manager.clone());
        tokio::spawn(async move {
            let _ = service.serve(server, "test").await;
        });
        Arc::new(Channel::connect(client))
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn names(handle: &Handle) -> Vec<String> {
        handle
            .fetch_all()
            .iter()
            .filter_map(|e| e.singleton("name").and_then(|v| v.as_primitive()?.as_str().map(String::from)))
            .collect()
    }

    #[tokio::test]
    async fn test_remote_and_local_handles_converge() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let key = StorageKey::reference_mode(StorageKey::ramdisk("people"), StorageKey::ramdisk("team"));

        let local_store = manager.get(&key, CrdtKind::Set).await.unwrap();
        let local = Handle::open("local", local_store, HandleOptions::default()).await.unwrap();

        let channel = served(&manager);
        let remote_store = RemoteStore::open(channel, key.clone(), CrdtKind::Set).await.unwrap();
        let remote = Handle::open("remote", remote_store.clone(), HandleOptions::default())
            .await
            .unwrap();
        eventually(|| remote.is_synced()).await;

        let ann = RawEntity::new("p1").with_singleton("name", Some(FieldValue::text("Ann")));
        assert!(remote.store(ann).await.unwrap());
        local.idle().await;
        eventually(|| names(&local) == vec!["Ann"]).await;

        let bo = RawEntity::new("p2").with_singleton("name", Some(FieldValue::text("Bo")));
        assert!(local.store(bo).await.unwrap());
        eventually(|| names(&remote) == vec!["Ann", "Bo"]).await;

        remote.close().await;
        remote_store.close().await;
        assert!(matches!(
            remote_store.on_proxy_message(ProxyMessage::sync_request(None)).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_local_subscribers_share_one_registration() {
        let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
        let channel = served(&manager);
        let store = RemoteStore::open(channel, StorageKey::ramdisk("shared"), CrdtKind::Set)
            .await
            .unwrap();

        let first = Handle::open("first", store.clone(), HandleOptions::default()).await.unwrap();
        let second = Handle::open("second", store.clone(), HandleOptions::default()).await.unwrap();
        eventually(|| first.is_synced() && second.is_synced()).await;

        first.store(RawEntity::new("e1")).await.unwrap();
        second.idle().await;
        assert_eq!(second.fetch_all_unfiltered().len(), 1);
    }
}
