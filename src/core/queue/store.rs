//! Ordered containers of pending messages.
//!
//! Every queue owns two stores: one for high-priority messages and one for
//! regular messages. The dispatcher always drains the priority store first.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::message::{MessageId, QueueMessage};

/// Contract shared by all store implementations.
///
/// A store is a plain container. It does not touch the message's lifecycle
/// state; the queue manager does that around each call.
pub trait MessageStore: Send + Sync + Debug {
    /// Appends to the back.
    fn put(&self, message: Arc<QueueMessage>);

    /// Inserts at the head, ahead of everything already stored.
    fn put_front(&self, message: Arc<QueueMessage>);

    /// Removes this exact message.
    fn remove(&self, message: &Arc<QueueMessage>) -> bool;

    fn remove_by_id(&self, id: &str) -> Option<Arc<QueueMessage>>;

    fn find(&self, id: &str) -> Option<Arc<QueueMessage>>;

    fn peek(&self) -> Option<Arc<QueueMessage>>;

    fn pull_next(&self) -> Option<Arc<QueueMessage>>;

    fn count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Messages created at or before `cutoff`, in store order.
    fn created_before(&self, cutoff: Instant) -> Vec<Arc<QueueMessage>>;

    /// Empties the store and returns what it held.
    fn destroy(&self) -> Vec<Arc<QueueMessage>>;
}

#[derive(Debug, Default)]
struct StoreInner {
    messages: VecDeque<Arc<QueueMessage>>,
    index: HashMap<MessageId, Arc<QueueMessage>>,
}

impl StoreInner {
    fn unlink(&mut self, message: &Arc<QueueMessage>) -> bool {
        let Some(pos) = self.messages.iter().position(|m| Arc::ptr_eq(m, message)) else {
            return false;
        };
        self.messages.remove(pos);
        if matches!(self.index.get(message.id()), Some(indexed) if Arc::ptr_eq(indexed, message)) {
            self.index.remove(message.id());
        }
        true
    }
}

/// In-memory FIFO store with an id index for lookups.
#[derive(Debug, Default)]
pub struct LinkedMessageStore {
    inner: Mutex<StoreInner>,
}

impl LinkedMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for LinkedMessageStore {
    fn put(&self, message: Arc<QueueMessage>) {
        let mut inner = self.inner.lock();
        inner.index.insert(message.id().to_string(), message.clone());
        inner.messages.push_back(message);
    }

    fn put_front(&self, message: Arc<QueueMessage>) {
        let mut inner = self.inner.lock();
        inner.index.insert(message.id().to_string(), message.clone());
        inner.messages.push_front(message);
    }

    fn remove(&self, message: &Arc<QueueMessage>) -> bool {
        self.inner.lock().unlink(message)
    }

    fn remove_by_id(&self, id: &str) -> Option<Arc<QueueMessage>> {
        let mut inner = self.inner.lock();
        let message = inner.index.get(id)?.clone();
        inner.unlink(&message);
        Some(message)
    }

    fn find(&self, id: &str) -> Option<Arc<QueueMessage>> {
        self.inner.lock().index.get(id).cloned()
    }

    fn peek(&self) -> Option<Arc<QueueMessage>> {
        self.inner.lock().messages.front().cloned()
    }

    fn pull_next(&self) -> Option<Arc<QueueMessage>> {
        let mut inner = self.inner.lock();
        let message = inner.messages.pop_front()?;
        if matches!(inner.index.get(message.id()), Some(indexed) if Arc::ptr_eq(indexed, &message)) {
            inner.index.remove(message.id());
        }
        Some(message)
    }

    fn count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    fn created_before(&self, cutoff: Instant) -> Vec<Arc<QueueMessage>> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.created_at() <= cutoff)
            .cloned()
            .collect()
    }

    fn destroy(&self) -> Vec<Arc<QueueMessage>> {
        let mut inner = self.inner.lock();
        inner.index.clear();
        inner.messages.drain(..).collect()
    }
}
