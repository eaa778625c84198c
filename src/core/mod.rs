pub mod auth;
pub mod decision;
pub mod delivery;
pub mod error;
pub mod events;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod rider;
pub mod subscriber;
