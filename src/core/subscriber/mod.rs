//! Queue subscribers.
//!
//! Provides the transport-facing [`Client`] trait, the channel-backed
//! [`ChannelClient`], and the per-queue [`ClientSubscriptionRegistry`].

pub mod client;
pub mod registry;

pub use client::{ChannelClient, Client, ClientId};
pub use registry::{ClientSubscriptionRegistry, QueueClient};
