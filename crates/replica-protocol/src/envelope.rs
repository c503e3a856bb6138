//! Cross-process envelopes
//!
//! A client sends [`Request`]s, each tagged with a sequence number. The
//! server answers every request with exactly one [`Reply`] carrying the same
//! sequence number, and streams callback traffic as [`ServerMessage::Push`].

use crate::message::{CallbackId, ProxyMessage};
use replica_core::{CrdtKind, StorageKey};
use serde::{Deserialize, Serialize};

/// Token naming one remote callback registration.
pub type Token = CallbackId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    /// Open (or reuse) the store at `storage_key` and subscribe to it.
    RegisterCallback {
        storage_key: StorageKey,
        kind: CrdtKind,
    },
    SendProxyMessage {
        token: Token,
        message: ProxyMessage,
    },
    UnregisterCallback {
        token: Token,
    },
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::RegisterCallback { .. } => "register_callback",
            RequestBody::SendProxyMessage { .. } => "send_proxy_message",
            RequestBody::UnregisterCallback { .. } => "unregister_callback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReplyValue {
    Token(Token),
    Bool(bool),
    Unit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub seq: u64,
    /// `Err` carries the remote failure message.
    pub result: Result<ReplyValue, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Reply(Reply),
    Push { token: Token, message: ProxyMessage },
}
