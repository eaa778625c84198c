use std::sync::Arc;

use crate::core::decision::Decision;
use crate::core::delivery::DeliveryHandler;
use crate::core::error::HorseError;
use crate::core::message::{Message, MessageDelivery, QueueMessage};
use crate::core::queue::HorseQueue;
use crate::core::subscriber::Client;

/// Allows everything, saves nothing, never acknowledges producers.
///
/// Messages that outlive the queue's message timeout are still dropped, so a
/// configured timeout keeps its meaning.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughHandler;

impl DeliveryHandler for PassThroughHandler {
    fn received_from_producer(
        &self,
        _queue: &HorseQueue,
        _message: &QueueMessage,
        _sender: Option<&Arc<dyn Client>>,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    fn begin_send(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    fn end_send(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    fn acknowledge_received(
        &self,
        _queue: &HorseQueue,
        _ack: &Message,
        _delivery: &MessageDelivery,
        _success: bool,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    fn acknowledge_timed_out(
        &self,
        _queue: &HorseQueue,
        _delivery: &MessageDelivery,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    fn message_timed_out(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(Decision::delete())
    }

    fn save_message(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<bool, HorseError> {
        Ok(false)
    }
}
