//! Queue configuration and state enums.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::core::decision::PutBackDecision;

/// How messages are distributed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Every ack-idle subscriber receives every message.
    #[default]
    Push,
    /// Exactly one subscriber receives each message, rotating.
    RoundRobin,
    /// Nothing is sent until a subscriber asks for it.
    Pull,
    /// Fan-out without redelivery or persistence.
    Broadcast,
    /// Broadcast that also keeps the latest message for pull requests.
    Cache,
}

impl QueueType {
    /// Whether messages may be saved or put back.
    pub fn retains_messages(self) -> bool {
        !matches!(self, QueueType::Broadcast | QueueType::Cache)
    }
}

/// Acknowledge requirement for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    #[default]
    None,
    /// Consumers are asked to acknowledge; sending does not wait for it.
    JustRequest,
    /// A consumer gets its next message only after acknowledging the last one.
    WaitForAcknowledge,
}

impl AckMode {
    pub fn requires_ack(self) -> bool {
        !matches!(self, AckMode::None)
    }
}

/// Point at which the producer receives its commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitWhen {
    None,
    #[default]
    AfterReceived,
    AfterSent,
    AfterAcknowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitExceededStrategy {
    #[default]
    RejectNewMessage,
    DeleteOldestMessage,
}

/// When an idle queue removes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDestroy {
    #[default]
    Disabled,
    NoMessages,
    NoConsumers,
    /// No messages and no consumers.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    NotInitialized,
    Running,
    OnlyPush,
    OnlyConsume,
    Paused,
    Syncing,
}

impl QueueStatus {
    pub fn can_push(self) -> bool {
        matches!(self, QueueStatus::Running | QueueStatus::OnlyPush)
    }

    pub fn can_consume(self) -> bool {
        matches!(self, QueueStatus::Running | QueueStatus::OnlyConsume)
    }

    fn is_operational(self) -> bool {
        matches!(
            self,
            QueueStatus::Running | QueueStatus::OnlyPush | QueueStatus::OnlyConsume | QueueStatus::Paused
        )
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        if self == next {
            return false;
        }
        match (self, next) {
            (QueueStatus::NotInitialized, QueueStatus::Running) => true,
            (QueueStatus::Syncing, QueueStatus::Running) => true,
            (from, QueueStatus::Syncing) => from.is_operational(),
            (from, to) => from.is_operational() && to.is_operational(),
        }
    }
}

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Per-queue options. Zero limits and timeouts mean "unlimited"/"disabled".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub queue_type: QueueType,
    pub acknowledge: AckMode,
    pub commit_when: CommitWhen,
    pub put_back: PutBackDecision,
    #[serde(rename = "message_timeout_ms", deserialize_with = "duration_ms")]
    pub message_timeout: Duration,
    #[serde(rename = "acknowledge_timeout_ms", deserialize_with = "duration_ms")]
    pub acknowledge_timeout: Duration,
    pub message_limit: usize,
    /// Maximum payload size in bytes.
    pub message_size_limit: usize,
    pub limit_exceeded_strategy: LimitExceededStrategy,
    #[serde(rename = "put_back_delay_ms", deserialize_with = "duration_ms")]
    pub put_back_delay: Duration,
    #[serde(rename = "delay_between_messages_ms", deserialize_with = "duration_ms")]
    pub delay_between_messages: Duration,
    pub auto_destroy: QueueDestroy,
    pub client_limit: usize,
    #[serde(rename = "tracker_interval_ms", deserialize_with = "duration_ms")]
    pub tracker_interval: Duration,
    /// Name of the registered queue manager factory.
    pub manager: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            queue_type: QueueType::Push,
            acknowledge: AckMode::None,
            commit_when: CommitWhen::AfterReceived,
            put_back: PutBackDecision::No,
            message_timeout: Duration::ZERO,
            acknowledge_timeout: Duration::from_secs(15),
            message_limit: 0,
            message_size_limit: 0,
            limit_exceeded_strategy: LimitExceededStrategy::RejectNewMessage,
            put_back_delay: Duration::ZERO,
            delay_between_messages: Duration::ZERO,
            auto_destroy: QueueDestroy::Disabled,
            client_limit: 0,
            tracker_interval: Duration::from_millis(250),
            manager: "default".to_string(),
        }
    }
}

impl QueueOptions {
    pub fn with_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn with_acknowledge(mut self, mode: AckMode) -> Self {
        self.acknowledge = mode;
        self
    }

    pub fn with_commit_when(mut self, commit_when: CommitWhen) -> Self {
        self.commit_when = commit_when;
        self
    }

    pub fn with_put_back(mut self, put_back: PutBackDecision) -> Self {
        self.put_back = put_back;
        self
    }

    pub fn with_acknowledge_timeout(mut self, timeout: Duration) -> Self {
        self.acknowledge_timeout = timeout;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_message_limit(mut self, limit: usize, strategy: LimitExceededStrategy) -> Self {
        self.message_limit = limit;
        self.limit_exceeded_strategy = strategy;
        self
    }

    pub fn with_message_size_limit(mut self, limit: usize) -> Self {
        self.message_size_limit = limit;
        self
    }

    pub fn with_put_back_delay(mut self, delay: Duration) -> Self {
        self.put_back_delay = delay;
        self
    }

    pub fn with_delay_between_messages(mut self, delay: Duration) -> Self {
        self.delay_between_messages = delay;
        self
    }

    pub fn with_auto_destroy(mut self, policy: QueueDestroy) -> Self {
        self.auto_destroy = policy;
        self
    }

    pub fn with_client_limit(mut self, limit: usize) -> Self {
        self.client_limit = limit;
        self
    }

    pub fn with_tracker_interval(mut self, interval: Duration) -> Self {
        self.tracker_interval = interval;
        self
    }

    pub fn with_manager(mut self, manager: impl Into<String>) -> Self {
        self.manager = manager.into();
        self
    }

    /// Acknowledge mode that actually applies to this queue type.
    pub fn effective_ack(&self) -> AckMode {
        if self.queue_type.retains_messages() {
            self.acknowledge
        } else {
            AckMode::None
        }
    }
}
