//! Single-consumer message queue with inception ordering
//!
//! Messages are handled strictly one at a time, in arrival order. A message
//! enqueued by a handler of the same queue (an "inception" message) does not
//! go to the back of the external FIFO: it is buffered locally and the
//! buffer is fully drained, in generation order, before the next external
//! message is taken. This keeps cascades caused by one message together.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

tokio::task_local! {
    /// Id of the queue whose handler is currently running on this task.
    static ACTIVE_QUEUE: u64;
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

pub type Handler<M> = Arc<dyn Fn(M) -> BoxFuture<'static, bool> + Send + Sync>;

struct Pending<M> {
    message: M,
    done: oneshot::Sender<bool>,
}

pub struct MessageQueue<M> {
    id: u64,
    sender: mpsc::UnboundedSender<Pending<M>>,
    inception: Arc<Mutex<VecDeque<Pending<M>>>>,
    size: Arc<watch::Sender<usize>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static> MessageQueue<M> {
    /// Spawns the consumer task. Must be called inside a tokio runtime.
    pub fn new(handler: Handler<M>) -> Self {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let inception = Arc::new(Mutex::new(VecDeque::new()));
        let (size, _) = watch::channel(0usize);
        let size = Arc::new(size);

        let consumer = tokio::spawn(run(id, receiver, handler, inception.clone(), size.clone()));

        Self {
            id,
            sender,
            inception,
            size,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Never blocks. The receipt resolves to the handler's result, or
    /// `false` if the queue is closed first.
    pub fn enqueue(&self, message: M) -> Receipt {
        let (done, receiver) = oneshot::channel();
        let pending = Pending { message, done };
        self.size.send_modify(|n| *n += 1);

        let inside_handler = ACTIVE_QUEUE.try_with(|active| *active == self.id).unwrap_or(false);
        if inside_handler {
            self.inception.lock().push_back(pending);
        } else if self.sender.send(pending).is_err() {
            self.size.send_modify(|n| *n = n.saturating_sub(1));
        }
        Receipt { receiver }
    }

    /// Messages accepted but not yet handled, including inception ones.
    pub fn len(&self) -> usize {
        *self.size.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once the queue has drained.
    pub async fn idle(&self) {
        let mut size = self.size.subscribe();
        let _ = size.wait_for(|n| *n == 0).await;
    }

    /// Aborts the consumer. Outstanding receipts resolve to `false`.
    pub fn close(&self) {
        if let Some(consumer) = self.consumer.lock().take() {
            consumer.abort();
        }
        self.inception.lock().clear();
        self.size.send_replace(0);
    }

    pub fn is_closed(&self) -> bool {
        self.consumer.lock().is_none()
    }
}

impl<M> Drop for MessageQueue<M> {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.lock().take() {
            consumer.abort();
        }
    }
}

async fn run<M: Send + 'static>(
    id: u64,
    mut receiver: mpsc::UnboundedReceiver<Pending<M>>,
    handler: Handler<M>,
    inception: Arc<Mutex<VecDeque<Pending<M>>>>,
    size: Arc<watch::Sender<usize>>,
) {
    while let Some(pending) = receiver.recv().await {
        process(id, &handler, pending, &size).await;
        loop {
            let next = inception.lock().pop_front();
            match next {
                Some(pending) => process(id, &handler, pending, &size).await,
                None => break,
            }
        }
    }
    debug!(queue = id, "Message queue consumer finished");
}

async fn process<M>(id: u64, handler: &Handler<M>, pending: Pending<M>, size: &watch::Sender<usize>) {
    let result = ACTIVE_QUEUE.scope(id, handler(pending.message)).await;
    let _ = pending.done.send(result);
    size.send_modify(|n| *n = n.saturating_sub(1));
}

/// Completion of one enqueued message.
pub struct Receipt {
    receiver: oneshot::Receiver<bool>,
}

impl Future for Receipt {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(false))
    }
}
