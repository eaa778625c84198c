//! Outcome of one step of a message's life.
//!
//! Decisions are plain values. Delivery handlers return them, the queue
//! performs the side effects they describe.

use serde::Deserialize;

/// Where a failed or timed-out message goes back into its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutBackDecision {
    /// Do not re-insert.
    #[default]
    No,
    /// Append to the back of the store.
    Regular,
    /// Re-insert at the head of the store.
    Priority,
}

/// Acknowledgment the producer receives about its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerAck {
    #[default]
    None,
    Commit,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Continue the current operation.
    pub allow: bool,
    /// Persist the message.
    pub save: bool,
    /// Remove the message permanently.
    pub delete: bool,
    pub put_back: PutBackDecision,
    pub transmit: ProducerAck,
}

impl Default for Decision {
    fn default() -> Self {
        Decision::allow()
    }
}

impl Decision {
    pub const fn allow() -> Self {
        Self {
            allow: true,
            save: false,
            delete: false,
            put_back: PutBackDecision::No,
            transmit: ProducerAck::None,
        }
    }

    pub const fn deny() -> Self {
        Self {
            allow: false,
            save: false,
            delete: false,
            put_back: PutBackDecision::No,
            transmit: ProducerAck::None,
        }
    }

    pub const fn delete() -> Self {
        Self {
            allow: true,
            save: false,
            delete: true,
            put_back: PutBackDecision::No,
            transmit: ProducerAck::None,
        }
    }

    pub const fn put_back(placement: PutBackDecision) -> Self {
        Self {
            allow: true,
            save: false,
            delete: false,
            put_back: placement,
            transmit: ProducerAck::None,
        }
    }

    pub const fn with_save(mut self) -> Self {
        self.save = true;
        self
    }

    pub const fn with_transmit(mut self, transmit: ProducerAck) -> Self {
        self.transmit = transmit;
        self
    }

    /// Drops the parts of the decision that would keep the message around.
    pub(crate) fn without_retention(mut self) -> Self {
        self.save = false;
        self.put_back = PutBackDecision::No;
        self
    }
}
