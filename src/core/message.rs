//! Message types used by the queue engine.
//!
//! * [`Message`] is the wire-level message produced by the external codec.
//!   The engine never looks inside its payload.
//! * [`QueueMessage`] wraps one wire message while a queue owns it and tracks
//!   its lifecycle (stored, in flight, waiting for put-back, removed).
//! * [`MessageDelivery`] pairs one queue message with one receiver and carries
//!   the acknowledge deadline and the single "resolved" flag that makes the
//!   ack path and the timeout path mutually exclusive.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::subscriber::{Client, ClientId};

pub type MessageId = String;

/// Header set on negative acknowledge messages.
pub const HEADER_NEGATIVE_ACK_REASON: &str = "Negative-Ack-Reason";

/// Type discriminator of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Queue,
    Direct,
    Ack,
    Response,
    Event,
}

/// Wire-level message as handed over by the protocol codec.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    /// Queue name (for queue messages) or the receiver of a direct message.
    pub target: String,
    pub content_type: u16,
    pub high_priority: bool,
    /// Producer asked to be told about the outcome of this message.
    pub wait_response: bool,
    pub payload: Bytes,
    pub headers: Vec<(String, String)>,
}

impl Message {
    /// Creates a queue message with a fresh id.
    pub fn new(target: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: new_message_id(),
            kind: MessageKind::Queue,
            target: target.into(),
            content_type: 0,
            high_priority: false,
            wait_response: false,
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_high_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }

    pub fn with_wait_response(mut self, wait_response: bool) -> Self {
        self.wait_response = wait_response;
        self
    }

    pub fn with_content_type(mut self, content_type: u16) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Builds the acknowledge message answering `self`.
    ///
    /// Consumers send it back to the queue, the engine sends it to producers.
    pub fn acknowledge(&self, success: bool) -> Message {
        let mut ack = Message {
            id: self.id.clone(),
            kind: MessageKind::Ack,
            target: self.target.clone(),
            content_type: 0,
            high_priority: false,
            wait_response: false,
            payload: Bytes::new(),
            headers: Vec::new(),
        };
        if !success {
            ack.headers
                .push((HEADER_NEGATIVE_ACK_REASON.to_string(), "none".to_string()));
        }
        ack
    }

    /// Builds a negative acknowledge carrying a reason.
    pub fn negative_acknowledge(&self, reason: impl Into<String>) -> Message {
        let mut ack = self.acknowledge(true);
        ack.headers
            .push((HEADER_NEGATIVE_ACK_REASON.to_string(), reason.into()));
        ack
    }

    /// True for an acknowledge message that does not carry a negative reason.
    pub fn is_positive_ack(&self) -> bool {
        self.kind == MessageKind::Ack && self.header(HEADER_NEGATIVE_ACK_REASON).is_none()
    }
}

pub fn new_message_id() -> MessageId {
    Uuid::new_v4().simple().to_string()
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Not yet handed to any store.
    Created = 0,
    /// Sitting in one of the queue's stores.
    Stored = 1,
    /// Pulled out of the store by a send attempt.
    InFlight = 2,
    /// A put-back has been decided and is waiting for its delay.
    PutBackPending = 3,
    /// Gone for good.
    Removed = 4,
}

impl MessageState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MessageState::Created,
            1 => MessageState::Stored,
            2 => MessageState::InFlight,
            3 => MessageState::PutBackPending,
            _ => MessageState::Removed,
        }
    }
}

/// History entry describing one hand-over of a message to a receiver.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub receiver: ClientId,
    pub first_acquirer: bool,
    pub sent_at: Instant,
}

/// A wire message owned by a queue.
pub struct QueueMessage {
    message: Message,
    created_at: Instant,
    high_priority: AtomicBool,
    saved: AtomicBool,
    state: AtomicU8,
    producer: Option<Arc<dyn Client>>,
    producer_notified: AtomicBool,
    first_acquired: AtomicBool,
    deliveries: Mutex<Vec<DeliveryRecord>>,
}

impl fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMessage")
            .field("id", &self.message.id)
            .field("high_priority", &self.is_high_priority())
            .field("saved", &self.is_saved())
            .field("state", &self.state())
            .finish()
    }
}

impl QueueMessage {
    pub fn new(message: Message, producer: Option<Arc<dyn Client>>) -> Self {
        let high_priority = message.high_priority;
        Self {
            message,
            created_at: Instant::now(),
            high_priority: AtomicBool::new(high_priority),
            saved: AtomicBool::new(false),
            state: AtomicU8::new(MessageState::Created as u8),
            producer,
            producer_notified: AtomicBool::new(false),
            first_acquired: AtomicBool::new(false),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.message.id
    }

    #[inline]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_high_priority(&self, value: bool) {
        self.high_priority.store(value, Ordering::Release);
    }

    pub fn is_saved(&self) -> bool {
        self.saved.load(Ordering::Acquire)
    }

    pub(crate) fn mark_saved(&self) {
        self.saved.store(true, Ordering::Release);
    }

    pub fn state(&self) -> MessageState {
        MessageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_removed(&self) -> bool {
        self.state() == MessageState::Removed
    }

    pub(crate) fn set_state(&self, state: MessageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves the message from `from` to `to`; false if someone else moved it first.
    pub(crate) fn transition(&self, from: MessageState, to: MessageState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the message removed and returns the state it had before.
    pub(crate) fn mark_removed(&self) -> MessageState {
        MessageState::from_u8(
            self.state
                .swap(MessageState::Removed as u8, Ordering::AcqRel),
        )
    }

    pub fn producer(&self) -> Option<&Arc<dyn Client>> {
        self.producer.as_ref()
    }

    /// Claims the right to send the single producer acknowledgment.
    pub(crate) fn claim_producer_ack(&self) -> bool {
        self.message.wait_response
            && self.producer.is_some()
            && !self.producer_notified.swap(true, Ordering::AcqRel)
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().len()
    }

    /// Receivers this message has been handed to, in order.
    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries.lock().clone()
    }

    fn record_delivery(&self, receiver: ClientId, sent_at: Instant) -> bool {
        let first = !self.first_acquired.swap(true, Ordering::AcqRel);
        self.deliveries.lock().push(DeliveryRecord {
            receiver,
            first_acquirer: first,
            sent_at,
        });
        first
    }
}

static NEXT_DELIVERY_ID: AtomicU64 = AtomicU64::new(1);

/// One message handed to one receiver.
pub struct MessageDelivery {
    id: u64,
    message: Arc<QueueMessage>,
    receiver: Arc<dyn Client>,
    first_acquirer: AtomicBool,
    sent_at: Mutex<Option<Instant>>,
    acknowledged: Mutex<Option<(bool, Instant)>>,
    deadline: Mutex<Option<Instant>>,
    resolved: AtomicBool,
}

impl fmt::Debug for MessageDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDelivery")
            .field("id", &self.id)
            .field("message", &self.message.id())
            .field("receiver", self.receiver.id())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl MessageDelivery {
    pub fn new(message: Arc<QueueMessage>, receiver: Arc<dyn Client>) -> Self {
        Self {
            id: NEXT_DELIVERY_ID.fetch_add(1, Ordering::Relaxed),
            message,
            receiver,
            first_acquirer: AtomicBool::new(false),
            sent_at: Mutex::new(None),
            acknowledged: Mutex::new(None),
            deadline: Mutex::new(None),
            resolved: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn message(&self) -> &Arc<QueueMessage> {
        &self.message
    }

    #[inline]
    pub fn receiver(&self) -> &Arc<dyn Client> {
        &self.receiver
    }

    pub fn receiver_id(&self) -> &ClientId {
        self.receiver.id()
    }

    /// True only for the very first client that received the message.
    pub fn is_first_acquirer(&self) -> bool {
        self.first_acquirer.load(Ordering::Acquire)
    }

    pub fn is_sent(&self) -> bool {
        self.sent_at.lock().is_some()
    }

    pub fn sent_at(&self) -> Option<Instant> {
        *self.sent_at.lock()
    }

    pub(crate) fn mark_sent(&self) {
        let now = Instant::now();
        *self.sent_at.lock() = Some(now);
        let first = self
            .message
            .record_delivery(self.receiver.id().clone(), now);
        self.first_acquirer.store(first, Ordering::Release);
    }

    pub fn acknowledge_deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub(crate) fn set_acknowledge_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.acknowledge_deadline(), Some(deadline) if now >= deadline)
    }

    /// Acknowledge outcome and the time it arrived, if any.
    pub fn acknowledge(&self) -> Option<(bool, Instant)> {
        *self.acknowledged.lock()
    }

    pub(crate) fn mark_acknowledged(&self, success: bool) {
        *self.acknowledged.lock() = Some((success, Instant::now()));
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Wins the right to resolve this delivery. Exactly one caller gets `true`.
    pub(crate) fn try_resolve(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }
}
