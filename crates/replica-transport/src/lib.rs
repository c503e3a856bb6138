//! Replica Transport
//!
//! Carries the proxy protocol across a process boundary:
//! - [`Channel`]: client side, one request in flight, replies matched by
//!   sequence number
//! - [`CallbackMultiplexer`]: shares one remote callback among listeners
//! - [`StorageService`]: server side over any byte stream
//! - [`RemoteStore`]: an `ActiveStore` on top of a channel
//! - [`TcpServer`]: accepts TCP connections for a service

pub mod channel;
pub mod error;
pub mod multiplexer;
pub mod remote_store;
pub mod service;
#[cfg(feature = "tcp")]
pub mod tcp;

pub use channel::Channel;
pub use error::{ChannelError, ChannelResult};
pub use multiplexer::CallbackMultiplexer;
pub use remote_store::RemoteStore;
pub use service::StorageService;
#[cfg(feature = "tcp")]
pub use tcp::TcpServer;
