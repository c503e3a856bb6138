//! Fan-out of remote callback traffic to in-process listeners

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use replica_protocol::{ProxyMessage, Token};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::warn;

const TOPIC_CAPACITY: usize = 1024;

enum Topic {
    /// Pushes that arrived before anyone subscribed.
    Backlog(Vec<ProxyMessage>),
    Live(broadcast::Sender<ProxyMessage>),
}

/// One broadcast topic per remote callback token, so several listeners
/// can share a single remote registration.
#[derive(Default)]
pub struct CallbackMultiplexer {
    topics: Mutex<HashMap<Token, Topic>>,
}

impl CallbackMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, token: Token, message: ProxyMessage) {
        let mut topics = self.topics.lock();
        match topics.entry(token).or_insert_with(|| Topic::Backlog(Vec::new())) {
            Topic::Backlog(pending) => pending.push(message),
            Topic::Live(sender) => {
                // No receivers left is fine; the token is being torn down.
                let _ = sender.send(message);
            }
        }
    }

    /// Messages pushed for `token`. The first subscriber also receives
    /// whatever arrived before it.
    pub fn subscribe(&self, token: Token) -> BoxStream<'static, ProxyMessage> {
        let (receiver, backlog) = {
            let mut topics = self.topics.lock();
            match topics.remove(&token) {
                Some(Topic::Live(sender)) => {
                    let receiver = sender.subscribe();
                    topics.insert(token, Topic::Live(sender));
                    (receiver, Vec::new())
                }
                Some(Topic::Backlog(pending)) => {
                    let (sender, receiver) = broadcast::channel(TOPIC_CAPACITY);
                    topics.insert(token, Topic::Live(sender));
                    (receiver, pending)
                }
                None => {
                    let (sender, receiver) = broadcast::channel(TOPIC_CAPACITY);
                    topics.insert(token, Topic::Live(sender));
                    (receiver, Vec::new())
                }
            }
        };

        let live = stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(token, missed, "Callback listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::iter(backlog).chain(live).boxed()
    }

    /// Ends every stream for `token`.
    pub fn remove(&self, token: Token) {
        self.topics.lock().remove(&token);
    }

    /// Ends every stream.
    pub fn clear(&self) {
        self.topics.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().is_empty()
    }
}
