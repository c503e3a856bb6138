//! Ordered outbound sends, held back until referenced entities arrive
//!
//! Each queued send may carry holds: `(entity id, required version)` pairs
//! naming backing data it needs. A send with open holds blocks every send
//! queued after it. Holds are released by [`SendQueue::notify_reference_hold`]
//! once the backing store reports a covering version.

use parking_lot::Mutex;
use replica_core::{ReferenceId, VersionMap};
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

type Runnable = Box<dyn FnOnce() + Send>;

struct QueuedSend {
    holds: BTreeMap<ReferenceId, VersionMap>,
    run: Runnable,
}

#[derive(Default)]
pub struct SendQueue {
    queue: Mutex<VecDeque<QueuedSend>>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `run`, to be invoked once `holds` are satisfied and every
    /// earlier send has run.
    pub fn enqueue(
        &self,
        holds: impl IntoIterator<Item = (ReferenceId, VersionMap)>,
        run: impl FnOnce() + Send + 'static,
    ) {
        let holds: BTreeMap<ReferenceId, VersionMap> = holds.into_iter().collect();
        if !holds.is_empty() {
            trace!(holds = holds.len(), "Send blocked on backing data");
        }
        self.queue.lock().push_back(QueuedSend {
            holds,
            run: Box::new(run),
        });
        self.flush();
    }

    pub fn enqueue_unblocked(&self, run: impl FnOnce() + Send + 'static) {
        self.enqueue(Vec::<(ReferenceId, VersionMap)>::new(), run);
    }

    /// The backing store now holds `id` at `version`.
    pub fn notify_reference_hold(&self, id: &str, version: &VersionMap) {
        {
            let mut queue = self.queue.lock();
            for send in queue.iter_mut() {
                let covered = send
                    .holds
                    .get(id)
                    .is_some_and(|required| version.dominates_or_equals(required));
                if covered {
                    send.holds.remove(id);
                }
            }
        }
        self.flush();
    }

    /// Runs unblocked sends from the head, outside the lock.
    fn flush(&self) {
        loop {
            let run = {
                let mut queue = self.queue.lock();
                match queue.front() {
                    Some(send) if send.holds.is_empty() => queue.pop_front().map(|send| send.run),
                    _ => None,
                }
            };
            match run {
                Some(run) => run(),
                None => break,
            }
        }
    }

    /// Sends still waiting.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drops every waiting send.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}
