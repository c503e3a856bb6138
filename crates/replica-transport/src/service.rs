//! Server side of the cross-process channel
//!
//! Each connection gets its own token table mapping remote callback tokens
//! to a store and the callback registered on it. Store callbacks are turned
//! into `Push` frames; requests are answered in order with one `Reply` each.

use crate::error::ChannelResult;
use bytes::BytesMut;
use replica_core::{CrdtKind, StorageKey};
use replica_protocol::codec;
use replica_protocol::{
    CallbackId, FrameDecoder, ProxyMessage, Reply, ReplyValue, Request, RequestBody, ServerMessage, Token,
};
use replica_storage::{ActiveStore, StoreError, StoreManager, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct Registration {
    store: Arc<dyn ActiveStore>,
    callback: CallbackId,
}

/// Hosts the stores of a [`StoreManager`] for remote channels.
#[derive(Clone)]
pub struct StorageService {
    manager: StoreManager,
}

impl StorageService {
    pub fn new(manager: StoreManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &StoreManager {
        &self.manager
    }

    /// Serves one connection until the peer goes away.
    pub async fn serve<IO>(&self, io: IO, client_id: &str) -> ChannelResult<()>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(io);
        let (outgoing, messages) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, messages));

        let mut connection = Connection {
            manager: &self.manager,
            outgoing: outgoing.clone(),
            registrations: HashMap::new(),
            next_token: 1,
        };
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 8192];
        info!(client = %client_id, "Channel opened");

        let result: ChannelResult<()> = 'read: loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            };
            decoder.feed(&buf[..n]);
            loop {
                match decoder.decode::<Request>() {
                    Ok(Some(request)) => {
                        let reply = connection.handle(request).await;
                        if outgoing.send(ServerMessage::Reply(reply)).is_err() {
                            break 'read Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => break 'read Err(e.into()),
                }
            }
        };

        connection.close().await;
        drop(connection);
        drop(outgoing);
        // Ends once every queued reply is written.
        let _ = writer_task.await;
        match &result {
            Ok(()) => info!(client = %client_id, "Channel closed"),
            Err(e) => error!(client = %client_id, error = %e, "Channel failed"),
        }
        result
    }
}

struct Connection<'a> {
    manager: &'a StoreManager,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
    registrations: HashMap<Token, Registration>,
    next_token: Token,
}

impl Connection<'_> {
    async fn handle(&mut self, request: Request) -> Reply {
        debug!(seq = request.seq, request = request.body.name(), "Handling request");
        let result = match request.body {
            RequestBody::RegisterCallback { storage_key, kind } => self
                .register(storage_key, kind)
                .await
                .map(ReplyValue::Token),
            RequestBody::SendProxyMessage { token, message } => {
                self.send(token, message).await.map(ReplyValue::Bool)
            }
            RequestBody::UnregisterCallback { token } => self.unregister(token).await.map(|_| ReplyValue::Unit),
        };
        if let Err(e) = &result {
            warn!(seq = request.seq, error = %e, "Request failed");
        }
        Reply {
            seq: request.seq,
            result: result.map_err(|e| e.to_string()),
        }
    }

    async fn register(&mut self, key: StorageKey, kind: CrdtKind) -> StoreResult<Token> {
        let store = self.manager.get(&key, kind).await?;
        let token = self.next_token;
        self.next_token += 1;

        let outgoing = self.outgoing.clone();
        let callback = store
            .on(Arc::new(move |message: ProxyMessage| {
                let _ = outgoing.send(ServerMessage::Push {
                    token,
                    message: message.with_id(Some(token)),
                });
            }))
            .await?;
        self.registrations.insert(token, Registration { store, callback });
        debug!(token, key = %key, "Registered remote callback");
        Ok(token)
    }

    async fn send(&self, token: Token, message: ProxyMessage) -> StoreResult<bool> {
        let registration = self.registration(token)?;
        registration
            .store
            .on_proxy_message(message.with_id(Some(registration.callback)))
            .await
    }

    async fn unregister(&mut self, token: Token) -> StoreResult<()> {
        self.registration(token)?;
        if let Some(registration) = self.registrations.remove(&token) {
            registration.store.off(registration.callback).await?;
        }
        Ok(())
    }

    fn registration(&self, token: Token) -> StoreResult<&Registration> {
        self.registrations
            .get(&token)
            .ok_or_else(|| StoreError::Transport(format!("unknown callback token {}", token)))
    }

    /// Drops every registration so store callbacks stop pushing.
    async fn close(&mut self) {
        for (_, registration) in self.registrations.drain() {
            let _ = registration.store.off(registration.callback).await;
        }
    }
}

async fn write_loop<W>(mut writer: W, mut messages: mpsc::UnboundedReceiver<ServerMessage>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    while let Some(message) = messages.recv().await {
        buf.clear();
        if let Err(e) = codec::encode_into(&message, &mut buf) {
            error!(error = %e, "Failed to encode server message");
            buf.clear();
            // A reply must still go out or the client waits forever.
            let ServerMessage::Reply(reply) = message else {
                continue;
            };
            let failure = ServerMessage::Reply(Reply {
                seq: reply.seq,
                result: Err(e.to_string()),
            });
            if codec::encode_into(&failure, &mut buf).is_err() {
                continue;
            }
        }
        if let Err(e) = writer.write_all(&buf).await {
            warn!(error = %e, "Write error, dropping connection output");
            break;
        }
    }
}
