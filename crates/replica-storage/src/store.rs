//! The contract every store exposes to its proxies

use crate::error::StoreResult;
use async_trait::async_trait;
use replica_core::{CrdtKind, StorageKey};
use replica_protocol::{CallbackId, ProxyCallback, ProxyMessage};

/// A live store: proxies subscribe with [`on`](ActiveStore::on) and talk to
/// it through [`on_proxy_message`](ActiveStore::on_proxy_message).
///
/// `on_proxy_message` answers:
/// - `SyncRequest`: the full model goes back to the requester, `Ok(true)`.
/// - `Operations`: applied in order. A causality gap sends a `SyncRequest`
///   back to the sender and yields `Ok(false)`.
/// - `ModelUpdate`: merged; changes are forwarded to the other subscribers.
///
/// Malformed input is an `Err` and leaves the store unchanged.
#[async_trait]
pub trait ActiveStore: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    fn kind(&self) -> CrdtKind;

    async fn on(&self, callback: ProxyCallback) -> StoreResult<CallbackId>;

    async fn off(&self, id: CallbackId) -> StoreResult<()>;

    async fn on_proxy_message(&self, message: ProxyMessage) -> StoreResult<bool>;

    /// Resolves once everything accepted so far has been processed.
    async fn idle(&self);

    async fn close(&self);
}
