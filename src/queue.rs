//! The bounded pending-message queue between the reader task and the
//! dispatch loop.
//!
//! The reader is the sole producer and the dispatch loop the sole consumer.
//! Bounding the queue is what gives the connection backpressure: once it
//! fills up the reader stalls, and the peer eventually blocks on its own
//! socket buffers.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::protocol::{Message, RequestId};

/// One entry in the pending queue.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    /// Sentinel: the input stream has closed. Not a protocol message, and
    /// never removed by cancellation.
    Closed,
}

pub struct PendingQueue {
    items: Mutex<VecDeque<Inbound>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue an entry, waiting while the queue is full.
    pub async fn push(&self, item: Inbound) {
        loop {
            {
                let mut items = self.items.lock().await;
                if items.len() < self.capacity {
                    items.push_back(item);
                    self.readable.notify_one();
                    return;
                }
            }
            self.writable.notified().await;
        }
    }

    /// Dequeue the oldest entry, giving up after `wait`. `None` means the
    /// wait timed out with the queue still empty.
    pub async fn pop(&self, wait: Duration) -> Option<Inbound> {
        tokio::time::timeout(wait, self.pop_next()).await.ok()
    }

    async fn pop_next(&self) -> Inbound {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    self.writable.notify_one();
                    return item;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Remove a still-queued request with the given id. Returns whether the
    /// cancellation hit; a miss means the request was already dispatched or
    /// never queued. Notifications, responses and the close sentinel are
    /// never touched.
    pub async fn cancel(&self, id: &RequestId) -> bool {
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|item| {
            !matches!(item, Inbound::Message(Message::Request(request)) if request.id == *id)
        });
        let removed = items.len() < before;
        if removed {
            self.writable.notify_one();
        }
        removed
    }
}
