//! Replication hook points.
//!
//! Clustering lives outside the engine. A synchronizer only tells the queue
//! whether it is being replicated right now and hears about store changes.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::core::message::QueueMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    None,
    /// Queue content is being shipped to another node; sending pauses.
    Syncing,
    /// Replica is receiving content from the primary.
    Receiving,
}

pub trait QueueSynchronizer: Send + Sync + Debug {
    fn status(&self) -> SyncStatus;

    fn message_added(&self, _message: &QueueMessage) {}

    fn message_removed(&self, _message: &QueueMessage) {}
}

/// Synchronizer for standalone nodes. Its status can be flipped by whoever
/// drives replication.
#[derive(Debug)]
pub struct LocalSynchronizer {
    status: AtomicU8,
}

impl Default for LocalSynchronizer {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(0),
        }
    }
}

impl LocalSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: SyncStatus) {
        let raw = match status {
            SyncStatus::None => 0,
            SyncStatus::Syncing => 1,
            SyncStatus::Receiving => 2,
        };
        self.status.store(raw, Ordering::Release);
    }
}

impl QueueSynchronizer for LocalSynchronizer {
    fn status(&self) -> SyncStatus {
        match self.status.load(Ordering::Acquire) {
            1 => SyncStatus::Syncing,
            2 => SyncStatus::Receiving,
            _ => SyncStatus::None,
        }
    }
}
