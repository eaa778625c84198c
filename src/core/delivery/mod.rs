//! Delivery decision handlers.
//!
//! A [`DeliveryHandler`] is consulted at every transition of a message's life
//! and answers with a [`Decision`]. The queue performs whatever side effect
//! the decision describes. Returning `Err` is how a handler reports a fault:
//! the queue routes it to [`DeliveryHandler::exception_thrown`].
//!
//! Two strategies ship with the crate:
//! * [`PassThroughHandler`] for fire-and-forget queues.
//! * [`AckDeliveryHandler`] driven by [`CommitWhen`](crate::core::queue::options::CommitWhen)
//!   and [`PutBackDecision`](crate::core::decision::PutBackDecision).

pub mod ack;
pub mod passthrough;

pub use ack::AckDeliveryHandler;
pub use passthrough::PassThroughHandler;

use std::fmt::Debug;
use std::sync::Arc;

use crate::core::decision::Decision;
use crate::core::error::HorseError;
use crate::core::message::{Message, MessageDelivery, QueueMessage};
use crate::core::queue::HorseQueue;
use crate::core::subscriber::{Client, QueueClient};

pub trait DeliveryHandler: Send + Sync + Debug {
    /// Message arrived from a producer and has not been stored yet.
    fn received_from_producer(
        &self,
        queue: &HorseQueue,
        message: &QueueMessage,
        sender: Option<&Arc<dyn Client>>,
    ) -> Result<Decision, HorseError>;

    /// The queue is about to hand the message to its first receiver.
    fn begin_send(&self, queue: &HorseQueue, message: &QueueMessage) -> Result<Decision, HorseError>;

    /// Per-receiver filter.
    fn can_consumer_receive(
        &self,
        _queue: &HorseQueue,
        _message: &QueueMessage,
        _receiver: &QueueClient,
    ) -> Result<bool, HorseError> {
        Ok(true)
    }

    fn consumer_received(
        &self,
        _queue: &HorseQueue,
        _delivery: &MessageDelivery,
        _receiver: &QueueClient,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    /// Transport refused the message. The queue moves on to the next candidate.
    fn consumer_receive_failed(
        &self,
        _queue: &HorseQueue,
        _delivery: &MessageDelivery,
        _receiver: &QueueClient,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    /// At least one receiver got the message.
    fn end_send(&self, queue: &HorseQueue, message: &QueueMessage) -> Result<Decision, HorseError>;

    fn acknowledge_received(
        &self,
        queue: &HorseQueue,
        ack: &Message,
        delivery: &MessageDelivery,
        success: bool,
    ) -> Result<Decision, HorseError>;

    fn acknowledge_timed_out(
        &self,
        queue: &HorseQueue,
        delivery: &MessageDelivery,
    ) -> Result<Decision, HorseError>;

    /// Message aged out of the store without ever being sent.
    fn message_timed_out(&self, queue: &HorseQueue, message: &QueueMessage) -> Result<Decision, HorseError>;

    /// Message left its store, for whatever reason.
    fn message_dequeued(&self, _queue: &HorseQueue, _message: &QueueMessage) {}

    /// One of the other callbacks failed. Must not fail itself; if it does
    /// the message is left where it is.
    fn exception_thrown(
        &self,
        _queue: &HorseQueue,
        _message: Option<&QueueMessage>,
        _error: &HorseError,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    /// Persistence hook. Returns true if the handler stored the message.
    fn save_message(&self, queue: &HorseQueue, message: &QueueMessage) -> Result<bool, HorseError>;
}
