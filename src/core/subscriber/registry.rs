use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::time::Instant;

use crate::core::error::HorseError;
use crate::core::message::MessageDelivery;
use crate::core::subscriber::{Client, ClientId};

/// A client's subscription to one queue.
pub struct QueueClient {
    client: Arc<dyn Client>,
    joined_at: Instant,
    /// Delivery this client still owes an acknowledge for.
    processing: Mutex<Option<Arc<MessageDelivery>>>,
}

impl fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueClient")
            .field("id", self.client.id())
            .field("processing", &self.processing.lock().as_ref().map(|d| d.id()))
            .finish()
    }
}

impl QueueClient {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            joined_at: Instant::now(),
            processing: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> &ClientId {
        self.client.id()
    }

    #[inline]
    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    pub fn is_processing(&self) -> bool {
        self.processing.lock().is_some()
    }

    pub fn currently_processing(&self) -> Option<Arc<MessageDelivery>> {
        self.processing.lock().clone()
    }

    /// Acknowledge deadline of the message in flight, if any.
    pub fn processing_deadline(&self) -> Option<Instant> {
        self.processing
            .lock()
            .as_ref()
            .and_then(|d| d.acknowledge_deadline())
    }

    /// Locks the in-flight slot so a busy check and the assignment that
    /// follows it happen as one step. Never hold it across a transport send.
    pub(crate) fn processing_slot(&self) -> MutexGuard<'_, Option<Arc<MessageDelivery>>> {
        self.processing.lock()
    }

    /// Clears the in-flight slot if it still holds `delivery_id`.
    pub(crate) fn end_processing(&self, delivery_id: u64) -> bool {
        let mut slot = self.processing.lock();
        match slot.as_ref() {
            Some(current) if current.id() == delivery_id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_processing(&self) -> Option<Arc<MessageDelivery>> {
        self.processing.lock().take()
    }
}

/// Subscribers of one queue, in join order.
#[derive(Debug, Default)]
pub struct ClientSubscriptionRegistry {
    clients: RwLock<Vec<Arc<QueueClient>>>,
    next: AtomicUsize,
}

impl ClientSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a client. Re-subscribing returns the existing record.
    ///
    /// `limit` of zero means unlimited.
    pub fn add(&self, client: Arc<dyn Client>, limit: usize) -> Result<Arc<QueueClient>, HorseError> {
        let mut clients = self.clients.write();
        if let Some(existing) = clients.iter().find(|c| c.id() == client.id()) {
            return Ok(existing.clone());
        }
        if limit > 0 && clients.len() >= limit {
            return Err(HorseError::ClientLimitExceeded(limit));
        }
        let record = Arc::new(QueueClient::new(client));
        clients.push(record.clone());
        Ok(record)
    }

    pub fn remove(&self, id: &ClientId) -> Option<Arc<QueueClient>> {
        let mut clients = self.clients.write();
        let pos = clients.iter().position(|c| c.id() == id)?;
        Some(clients.remove(pos))
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<QueueClient>> {
        self.clients.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.read().iter().any(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<QueueClient>> {
        self.clients.read().clone()
    }

    /// Subscribers rotated so the next round-robin receiver comes first.
    pub fn round_robin_order(&self) -> Vec<Arc<QueueClient>> {
        let clients = self.clients.read();
        if clients.is_empty() {
            return Vec::new();
        }
        let start = self.next.load(Ordering::Acquire) % clients.len();
        clients[start..]
            .iter()
            .chain(clients[..start].iter())
            .cloned()
            .collect()
    }

    /// Moves the rotation past `id` after it received a message.
    pub fn advance_past(&self, id: &ClientId) {
        let clients = self.clients.read();
        if let Some(pos) = clients.iter().position(|c| c.id() == id) {
            self.next.store((pos + 1) % clients.len(), Ordering::Release);
        }
    }

    pub(crate) fn drain(&self) -> Vec<Arc<QueueClient>> {
        std::mem::take(&mut *self.clients.write())
    }
}
