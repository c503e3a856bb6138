//! Subscriber registry owned by every store

use crate::message::{CallbackId, ProxyMessage};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Receives messages from a store. Must not block.
pub type ProxyCallback = Arc<dyn Fn(ProxyMessage) + Send + Sync>;

/// Explicit `id -> callback` table.
///
/// Ids are handed out from 1 upwards and never reused. Broadcasts visit
/// subscribers in ascending id order, and callbacks run outside the table
/// lock so they may register or unregister re-entrantly.
pub struct CallbackManager {
    inner: Mutex<Registry>,
}

struct Registry {
    next_id: CallbackId,
    callbacks: BTreeMap<CallbackId, ProxyCallback>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                next_id: 1,
                callbacks: BTreeMap::new(),
            }),
        }
    }

    pub fn register(&self, callback: ProxyCallback) -> CallbackId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.insert(id, callback);
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        self.inner.lock().callbacks.remove(&id).is_some()
    }

    pub fn get(&self, id: CallbackId) -> Option<ProxyCallback> {
        self.inner.lock().callbacks.get(&id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().callbacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn clear(&self) {
        self.inner.lock().callbacks.clear();
    }

    /// Delivers to one subscriber. Returns `false` if it is gone.
    pub fn send_to(&self, id: CallbackId, message: ProxyMessage) -> bool {
        match self.get(id) {
            Some(callback) => {
                callback(message);
                true
            }
            None => false,
        }
    }

    /// Delivers to every subscriber.
    pub fn send(&self, message: ProxyMessage) {
        self.send_except(message, None);
    }

    /// Delivers to every subscriber except `except`.
    pub fn send_except(&self, message: ProxyMessage, except: Option<CallbackId>) {
        let targets: Vec<ProxyCallback> = {
            let inner = self.inner.lock();
            inner
                .callbacks
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for callback in targets {
            callback(message.clone());
        }
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallbackManager")
            .field("next_id", &inner.next_id)
            .field("ids", &inner.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<(u64, Option<u64>)>>>, tag: u64) -> ProxyCallback {
        let log = log.clone();
        Arc::new(move |msg: ProxyMessage| log.lock().push((tag, msg.id())))
    }

    #[test]
    fn test_ids_start_at_one_and_are_not_reused() {
        let manager = CallbackManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = manager.register(recorder(&log, 1));
        let b = manager.register(recorder(&log, 2));
        assert_eq!((a, b), (1, 2));
        assert!(manager.unregister(a));
        assert!(!manager.unregister(a));
        assert_eq!(manager.register(recorder(&log, 3)), 3);
    }

    #[test]
    fn test_broadcast_order_and_exclusion() {
        let manager = CallbackManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 1..=3 {
            manager.register(recorder(&log, tag));
        }

        manager.send_except(ProxyMessage::sync_request(Some(2)), Some(2));
        assert_eq!(*log.lock(), vec![(1, Some(2)), (3, Some(2))]);

        log.lock().clear();
        assert!(manager.send_to(2, ProxyMessage::sync_request(None)));
        assert!(!manager.send_to(9, ProxyMessage::sync_request(None)));
        assert_eq!(*log.lock(), vec![(2, None)]);
    }

    #[test]
    fn test_callback_may_unregister_itself() {
        let manager = Arc::new(CallbackManager::new());
        let m = manager.clone();
        let id = manager.register(Arc::new(move |_| {
            m.unregister(1);
        }));
        manager.send(ProxyMessage::sync_request(None));
        assert_eq!(id, 1);
        assert!(manager.is_empty());
    }
}
