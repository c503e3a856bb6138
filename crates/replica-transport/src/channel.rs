//! Client side of the cross-process channel
//!
//! One reader task decodes server frames, resolving replies by sequence
//! number and handing pushes to the [`CallbackMultiplexer`]. One writer task
//! encodes requests. Requests go out strictly one at a time: a send waits
//! for the previous request's reply before it is written.

use crate::error::{ChannelError, ChannelResult};
use crate::multiplexer::CallbackMultiplexer;
use bytes::BytesMut;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use replica_core::{CrdtKind, StorageKey};
use replica_protocol::codec;
use replica_protocol::{FrameDecoder, ProxyMessage, ReplyValue, Request, RequestBody, ServerMessage, Token};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

type ReplySender = oneshot::Sender<Result<ReplyValue, String>>;

struct Shared {
    pending: Mutex<HashMap<u64, ReplySender>>,
    multiplexer: CallbackMultiplexer,
    closed: AtomicBool,
}

impl Shared {
    /// Marks the channel closed and fails every outstanding request.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        self.multiplexer.clear();
    }
}

pub struct Channel {
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    outgoing: mpsc::UnboundedSender<Request>,
    in_flight: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    /// Spawns the reader and writer tasks over `io`.
    pub fn connect<IO>(io: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            multiplexer: CallbackMultiplexer::new(),
            closed: AtomicBool::new(false),
        });
        let (outgoing, requests) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(read_loop(reader, shared.clone()));
        let write_task = tokio::spawn(write_loop(writer, requests, shared.clone()));

        Self {
            shared,
            next_seq: AtomicU64::new(1),
            outgoing,
            in_flight: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(vec![read_task, write_task]),
        }
    }

    #[cfg(feature = "tcp")]
    pub async fn connect_tcp(addr: impl tokio::net::ToSocketAddrs) -> ChannelResult<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::connect(stream))
    }

    /// Opens (or reuses) the remote store and subscribes to it.
    pub async fn register_callback(&self, storage_key: StorageKey, kind: CrdtKind) -> ChannelResult<Token> {
        match self.request(RequestBody::RegisterCallback { storage_key, kind }).await? {
            ReplyValue::Token(token) => Ok(token),
            _ => Err(ChannelError::UnexpectedReply {
                request: "register_callback",
            }),
        }
    }

    pub async fn send_proxy_message(&self, token: Token, message: ProxyMessage) -> ChannelResult<bool> {
        match self.request(RequestBody::SendProxyMessage { token, message }).await? {
            ReplyValue::Bool(applied) => Ok(applied),
            _ => Err(ChannelError::UnexpectedReply {
                request: "send_proxy_message",
            }),
        }
    }

    pub async fn unregister_callback(&self, token: Token) -> ChannelResult<()> {
        self.request(RequestBody::UnregisterCallback { token }).await?;
        self.shared.multiplexer.remove(token);
        Ok(())
    }

    /// Messages the remote store pushes to `token`.
    pub fn subscribe(&self, token: Token) -> BoxStream<'static, ProxyMessage> {
        self.shared.multiplexer.subscribe(token)
    }

    /// Resolves once no request is in flight.
    pub async fn flush(&self) {
        let _in_flight = self.in_flight.lock().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stops both tasks and fails outstanding requests.
    pub fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.shut();
        debug!("Channel disconnected");
    }

    async fn request(&self, body: RequestBody) -> ChannelResult<ReplyValue> {
        let _in_flight = self.in_flight.lock().await;
        let name = body.name();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();

        self.shared.pending.lock().insert(seq, reply);
        // Checked after registering so a concurrent shutdown can't miss us.
        if self.is_closed() {
            self.shared.pending.lock().remove(&seq);
            return Err(ChannelError::Closed);
        }
        if self.outgoing.send(Request { seq, body }).is_err() {
            self.shared.pending.lock().remove(&seq);
            return Err(ChannelError::Closed);
        }
        trace!(seq, request = name, "Request sent");

        match receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ChannelError::Remote(message)),
            Err(_) => Err(ChannelError::Closed),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Server closed the channel");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Channel read error");
                break;
            }
        };
        decoder.feed(&buf[..n]);

        loop {
            match decoder.decode::<ServerMessage>() {
                Ok(Some(ServerMessage::Reply(reply))) => {
                    let waiter = shared.pending.lock().remove(&reply.seq);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(reply.result);
                        }
                        None => warn!(seq = reply.seq, "Reply for unknown request"),
                    }
                }
                Ok(Some(ServerMessage::Push { token, message })) => {
                    trace!(token, kind = message.kind(), "Push received");
                    shared.multiplexer.publish(token, message);
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Undecodable frame, closing channel");
                    break 'read;
                }
            }
        }
    }
    shared.shut();
}

async fn write_loop<W>(mut writer: W, mut requests: mpsc::UnboundedReceiver<Request>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    while let Some(request) = requests.recv().await {
        buf.clear();
        if let Err(e) = codec::encode_into(&request, &mut buf) {
            // Fail just this request; the stream is still in sync.
            error!(seq = request.seq, error = %e, "Failed to encode request");
            shared.pending.lock().remove(&request.seq);
            continue;
        }
        if let Err(e) = writer.write_all(&buf).await {
            error!(error = %e, "Channel write error");
            break;
        }
    }
    shared.shut();
}
