//! Channel error types

use replica_protocol::ProtocolError;
use replica_storage::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer handled the request and reported a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected reply to {request}")]
    UnexpectedReply { request: &'static str },

    #[error("Channel closed")]
    Closed,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

impl From<ChannelError> for StoreError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => StoreError::Closed,
            other => StoreError::Transport(other.to_string()),
        }
    }
}
