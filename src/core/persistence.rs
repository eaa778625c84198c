//! Persistence store contract.
//!
//! The on-disk format belongs to whoever implements [`PersistenceStore`]. The
//! engine only calls it through the persistent queue manager.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::core::error::HorseError;
use crate::core::message::Message;

pub trait PersistenceStore: Send + Sync + Debug {
    fn open(&self) -> Result<(), HorseError>;

    fn close(&self) -> Result<(), HorseError>;

    /// Messages persisted for `queue`, oldest first.
    fn load(&self, queue: &str) -> Result<Vec<Message>, HorseError>;

    fn save(&self, queue: &str, message: &Message) -> Result<bool, HorseError>;

    fn delete(&self, queue: &str, message_id: &str) -> Result<bool, HorseError>;

    /// Compacts whatever the backend accumulated.
    fn shrink(&self) -> Result<(), HorseError>;
}

/// Map-backed store, handy for tests and embedded brokers that only need
/// messages to survive a queue being re-created.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    queues: DashMap<String, Vec<Message>>,
    open: AtomicBool,
    shrinks: AtomicU64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn stored(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    pub fn shrink_count(&self) -> u64 {
        self.shrinks.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), HorseError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(HorseError::Persistence("store is closed".into()))
        }
    }
}

impl PersistenceStore for MemoryPersistence {
    fn open(&self) -> Result<(), HorseError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<(), HorseError> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn load(&self, queue: &str) -> Result<Vec<Message>, HorseError> {
        self.ensure_open()?;
        Ok(self.queues.get(queue).map(|q| q.clone()).unwrap_or_default())
    }

    fn save(&self, queue: &str, message: &Message) -> Result<bool, HorseError> {
        self.ensure_open()?;
        let mut entry = self.queues.entry(queue.to_string()).or_default();
        if entry.iter().any(|m| m.id == message.id) {
            return Ok(false);
        }
        entry.push(message.clone());
        Ok(true)
    }

    fn delete(&self, queue: &str, message_id: &str) -> Result<bool, HorseError> {
        self.ensure_open()?;
        let Some(mut entry) = self.queues.get_mut(queue) else {
            return Ok(false);
        };
        let before = entry.len();
        entry.retain(|m| m.id != message_id);
        Ok(entry.len() != before)
    }

    fn shrink(&self) -> Result<(), HorseError> {
        self.queues.retain(|_, messages| !messages.is_empty());
        let n = self.shrinks.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: "horsemq::persistence", shrinks = n, "memory persistence shrunk");
        Ok(())
    }
}
