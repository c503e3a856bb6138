//! Messages exchanged between stores and their proxies

use replica_core::{CrdtData, CrdtOperation};
use serde::{Deserialize, Serialize};

/// Subscriber id handed out by a store's callback registry.
pub type CallbackId = u64;

/// The three proxy message kinds. `id` names the subscriber the message
/// came from (inbound) or is addressed to (replies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyMessage {
    /// Ask for the full state.
    SyncRequest { id: Option<CallbackId> },
    /// Full state push.
    ModelUpdate {
        model: CrdtData,
        id: Option<CallbackId>,
    },
    /// Incremental deltas, applied in order.
    Operations {
        operations: Vec<CrdtOperation>,
        id: Option<CallbackId>,
    },
}

impl ProxyMessage {
    pub fn sync_request(id: Option<CallbackId>) -> Self {
        ProxyMessage::SyncRequest { id }
    }

    pub fn model_update(model: CrdtData, id: Option<CallbackId>) -> Self {
        ProxyMessage::ModelUpdate { model, id }
    }

    pub fn operations(operations: Vec<CrdtOperation>, id: Option<CallbackId>) -> Self {
        ProxyMessage::Operations { operations, id }
    }

    pub fn id(&self) -> Option<CallbackId> {
        match self {
            ProxyMessage::SyncRequest { id }
            | ProxyMessage::ModelUpdate { id, .. }
            | ProxyMessage::Operations { id, .. } => *id,
        }
    }

    /// Same message with a different subscriber id.
    pub fn with_id(mut self, new_id: Option<CallbackId>) -> Self {
        match &mut self {
            ProxyMessage::SyncRequest { id }
            | ProxyMessage::ModelUpdate { id, .. }
            | ProxyMessage::Operations { id, .. } => *id = new_id,
        }
        self
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyMessage::SyncRequest { .. } => "sync_request",
            ProxyMessage::ModelUpdate { .. } => "model_update",
            ProxyMessage::Operations { .. } => "operations",
        }
    }
}
