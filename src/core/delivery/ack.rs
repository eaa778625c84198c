use std::sync::Arc;

use tracing::debug;

use crate::core::decision::{Decision, ProducerAck, PutBackDecision};
use crate::core::delivery::DeliveryHandler;
use crate::core::error::HorseError;
use crate::core::message::{Message, MessageDelivery, QueueMessage};
use crate::core::queue::options::{AckMode, CommitWhen, QueueOptions};
use crate::core::queue::HorseQueue;
use crate::core::subscriber::Client;

/// Acknowledge-aware strategy.
///
/// | step | decision |
/// |---|---|
/// | received | allow, commit if `AfterReceived`, save if persistent |
/// | end send | delete when the queue does not ask for acks, else keep |
/// | ack ok | delete, commit if `AfterAcknowledge` |
/// | nack / ack timeout | put back per policy, or delete (+ failed) when policy is `No` |
/// | message timeout | delete, failed |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckDeliveryHandler {
    commit_when: CommitWhen,
    put_back: PutBackDecision,
    save_on_receive: bool,
}

impl AckDeliveryHandler {
    pub fn new(commit_when: CommitWhen, put_back: PutBackDecision) -> Self {
        Self {
            commit_when,
            put_back,
            save_on_receive: false,
        }
    }

    pub fn from_options(options: &QueueOptions) -> Self {
        Self::new(options.commit_when, options.put_back)
    }

    /// Ask the queue to persist every message it accepts.
    pub fn with_save_on_receive(mut self, save: bool) -> Self {
        self.save_on_receive = save;
        self
    }

    pub fn commit_when(&self) -> CommitWhen {
        self.commit_when
    }

    pub fn put_back(&self) -> PutBackDecision {
        self.put_back
    }

    fn received_decision(&self) -> Decision {
        let mut decision = Decision::allow();
        if self.save_on_receive {
            decision = decision.with_save();
        }
        if self.commit_when == CommitWhen::AfterReceived {
            decision = decision.with_transmit(ProducerAck::Commit);
        }
        decision
    }

    fn end_send_decision(&self, ack: AckMode) -> Decision {
        let transmit = if self.commit_when == CommitWhen::AfterSent {
            ProducerAck::Commit
        } else {
            ProducerAck::None
        };

        if ack.requires_ack() {
            Decision::allow().with_transmit(transmit)
        } else {
            // Nothing will come back from the consumer. An `AfterAcknowledge`
            // producer is committed now since no acknowledge will ever arrive.
            let transmit = if self.commit_when == CommitWhen::AfterAcknowledge {
                ProducerAck::Commit
            } else {
                transmit
            };
            Decision::delete().with_transmit(transmit)
        }
    }

    fn acknowledge_decision(&self, success: bool) -> Decision {
        if success {
            let transmit = if self.commit_when == CommitWhen::AfterAcknowledge {
                ProducerAck::Commit
            } else {
                ProducerAck::None
            };
            return Decision::delete().with_transmit(transmit);
        }
        self.failure_decision()
    }

    fn failure_decision(&self) -> Decision {
        match self.put_back {
            PutBackDecision::No => {
                let transmit = if self.commit_when == CommitWhen::AfterAcknowledge {
                    ProducerAck::Failed
                } else {
                    ProducerAck::None
                };
                Decision::delete().with_transmit(transmit)
            }
            placement => Decision::put_back(placement),
        }
    }
}

impl DeliveryHandler for AckDeliveryHandler {
    fn received_from_producer(
        &self,
        _queue: &HorseQueue,
        _message: &QueueMessage,
        _sender: Option<&Arc<dyn Client>>,
    ) -> Result<Decision, HorseError> {
        Ok(self.received_decision())
    }

    fn begin_send(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    fn end_send(&self, queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(self.end_send_decision(queue.ack_mode()))
    }

    fn acknowledge_received(
        &self,
        queue: &HorseQueue,
        _ack: &Message,
        delivery: &MessageDelivery,
        success: bool,
    ) -> Result<Decision, HorseError> {
        debug!(
            target: "horsemq::delivery",
            queue = %queue.name(),
            message_id = %delivery.message().id(),
            receiver = %delivery.receiver_id(),
            success,
            "acknowledge received"
        );
        Ok(self.acknowledge_decision(success))
    }

    fn acknowledge_timed_out(
        &self,
        _queue: &HorseQueue,
        _delivery: &MessageDelivery,
    ) -> Result<Decision, HorseError> {
        Ok(self.failure_decision())
    }

    fn message_timed_out(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(Decision::delete().with_transmit(ProducerAck::Failed))
    }

    fn save_message(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<bool, HorseError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_after_received() {
        let h = AckDeliveryHandler::new(CommitWhen::AfterReceived, PutBackDecision::No);
        let d = h.received_decision();
        assert!(d.allow);
        assert!(!d.save);
        assert_eq!(d.transmit, ProducerAck::Commit);

        let persistent = h.with_save_on_receive(true).received_decision();
        assert!(persistent.save);
    }

    #[test]
    fn end_send_without_ack_deletes() {
        let h = AckDeliveryHandler::new(CommitWhen::AfterSent, PutBackDecision::Priority);
        let d = h.end_send_decision(AckMode::None);
        assert!(d.delete);
        assert_eq!(d.put_back, PutBackDecision::No);
        assert_eq!(d.transmit, ProducerAck::Commit);
    }

    #[test]
    fn end_send_with_ack_keeps_message() {
        let h = AckDeliveryHandler::new(CommitWhen::AfterAcknowledge, PutBackDecision::Regular);
        let d = h.end_send_decision(AckMode::WaitForAcknowledge);
        assert!(d.allow);
        assert!(!d.delete);
        assert_eq!(d.transmit, ProducerAck::None);
    }

    #[test]
    fn positive_ack_deletes_and_commits() {
        let h = AckDeliveryHandler::new(CommitWhen::AfterAcknowledge, PutBackDecision::Regular);
        let d = h.acknowledge_decision(true);
        assert!(d.delete);
        assert_eq!(d.transmit, ProducerAck::Commit);
    }

    #[test]
    fn negative_ack_follows_put_back_policy() {
        let regular = AckDeliveryHandler::new(CommitWhen::AfterReceived, PutBackDecision::Regular);
        assert_eq!(
            regular.acknowledge_decision(false),
            Decision::put_back(PutBackDecision::Regular)
        );

        let priority = AckDeliveryHandler::new(CommitWhen::AfterReceived, PutBackDecision::Priority);
        assert_eq!(
            priority.failure_decision(),
            Decision::put_back(PutBackDecision::Priority)
        );

        let drop = AckDeliveryHandler::new(CommitWhen::AfterAcknowledge, PutBackDecision::No);
        let d = drop.acknowledge_decision(false);
        assert!(d.delete);
        assert_eq!(d.transmit, ProducerAck::Failed);
    }
}
