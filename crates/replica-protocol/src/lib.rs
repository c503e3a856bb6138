//! Replica proxy protocol
//!
//! Stores and proxies talk in three messages: `SyncRequest`, `ModelUpdate`
//! and `Operations`. Each store owns a [`CallbackManager`] of subscribers.
//! Across a process boundary the messages travel inside [`envelope`] types,
//! framed by [`codec`]:
//!
//! ```text
//! client -> server   Request { seq, RegisterCallback | SendProxyMessage | UnregisterCallback }
//! server -> client   Reply { seq, Ok(Token | Bool | Unit) | Err(message) }
//!                    Push { token, ProxyMessage }
//! ```

pub mod callback;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;

pub use callback::{CallbackManager, ProxyCallback};
pub use codec::FrameDecoder;
pub use envelope::{Reply, ReplyValue, Request, RequestBody, ServerMessage, Token};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{CallbackId, ProxyMessage};
