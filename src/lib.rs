//! HorseMQ – an embeddable queue delivery engine.
//!
//! This crate exports
//!  * `core`    – messages, queues, delivery handlers, the `Rider` broker context
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – tracing subscriber setup
//!
//! The wire codec and the network server are not part of this crate: a
//! connection layer implements [`Client`] and feeds decoded [`Message`]s to a
//! [`Rider`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use core::decision::{Decision, ProducerAck, PutBackDecision};
pub use core::delivery::{AckDeliveryHandler, DeliveryHandler, PassThroughHandler};
pub use core::error::{ConsumeError, ConsumeErrorKind, HorseError};
pub use core::message::{Message, MessageDelivery, MessageKind, QueueMessage};
pub use core::queue::{
    AckMode, AckResult, CommitWhen, HorseQueue, LimitExceededStrategy, PullResult, PushResult, QueueDestroy,
    QueueOptions, QueueStatus, QueueType,
};
pub use core::rider::{Rider, RiderBuilder};
pub use core::subscriber::{ChannelClient, Client, ClientId};
