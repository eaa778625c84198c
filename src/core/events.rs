//! Queue notifications.
//!
//! [`EventSink`] is fire-and-forget: the engine never looks at what a sink
//! does with an event. [`QueueEventHandler`] is consulted before a status
//! change and may veto it.

use std::fmt::Debug;

use tracing::info;

use crate::core::queue::options::QueueStatus;
use crate::core::queue::HorseQueue;
use crate::core::subscriber::ClientId;

pub trait EventSink: Send + Sync + Debug {
    fn queue_created(&self, _queue: &str) {}

    fn queue_removed(&self, _queue: &str) {}

    fn client_subscribed(&self, _queue: &str, _client: &ClientId) {}

    fn client_unsubscribed(&self, _queue: &str, _client: &ClientId) {}

    fn status_changed(&self, _queue: &str, _from: QueueStatus, _to: QueueStatus) {}

    fn message_produced(&self, _queue: &str, _message_id: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {}

/// Writes every event to the `horsemq::events` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn queue_created(&self, queue: &str) {
        info!(target: "horsemq::events", queue, "queue created");
    }

    fn queue_removed(&self, queue: &str) {
        info!(target: "horsemq::events", queue, "queue removed");
    }

    fn client_subscribed(&self, queue: &str, client: &ClientId) {
        info!(target: "horsemq::events", queue, %client, "client subscribed");
    }

    fn client_unsubscribed(&self, queue: &str, client: &ClientId) {
        info!(target: "horsemq::events", queue, %client, "client unsubscribed");
    }

    fn status_changed(&self, queue: &str, from: QueueStatus, to: QueueStatus) {
        info!(target: "horsemq::events", queue, ?from, ?to, "queue status changed");
    }

    fn message_produced(&self, queue: &str, message_id: &str) {
        tracing::trace!(target: "horsemq::events", queue, message_id, "message produced");
    }
}

pub trait QueueEventHandler: Send + Sync + Debug {
    /// Returning false keeps the queue in `from`.
    fn on_status_changing(&self, queue: &HorseQueue, from: QueueStatus, to: QueueStatus) -> bool;
}
