use std::fmt;

use thiserror::Error;

use crate::core::queue::options::QueueStatus;
use crate::core::subscriber::ClientId;

#[derive(Debug, Clone, Error)]
pub enum HorseError {
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("queue '{0}' already exists")]
    QueueExists(String),

    #[error("invalid queue name '{0}'")]
    InvalidQueueName(String),

    #[error("operation '{0}' is not authorized")]
    Unauthorized(&'static str),

    #[error("client {0} is not subscribed to the queue")]
    ClientNotSubscribed(ClientId),

    #[error("queue client limit ({0}) exceeded")]
    ClientLimitExceeded(usize),

    #[error("queue status {0:?} does not allow this operation")]
    StatusNotSupported(QueueStatus),

    #[error("client {0} is disconnected")]
    Disconnected(ClientId),

    #[error("queue manager '{0}' is not registered")]
    UnknownManager(String),

    #[error("delivery handler error: {0}")]
    Handler(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("queue has been destroyed")]
    Destroyed,
}

impl HorseError {
    /// Shorthand used by delivery handlers to report a fault.
    pub fn handler(reason: impl Into<String>) -> Self {
        HorseError::Handler(reason.into())
    }
}

/// What went wrong while a consumer was handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeErrorKind {
    /// Transport refused the message.
    SendFailed,
    /// Consumer answered with a negative acknowledge.
    NegativeAcknowledge,
    /// Consumer never answered before the acknowledge deadline.
    AcknowledgeTimeout,
    /// A delivery handler callback failed while processing the message.
    HandlerFault(String),
}

/// Typed consumer failure forwarded to the broker's error channel.
#[derive(Debug, Clone)]
pub struct ConsumeError {
    pub queue: String,
    pub message_id: String,
    pub client: Option<ClientId>,
    pub kind: ConsumeErrorKind,
}

impl fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.client {
            Some(client) => write!(
                f,
                "{:?} for message {} on queue {} (client {client})",
                self.kind, self.message_id, self.queue
            ),
            None => write!(
                f,
                "{:?} for message {} on queue {}",
                self.kind, self.message_id, self.queue
            ),
        }
    }
}
