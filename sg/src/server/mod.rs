//! TCP broker server
//!
//! Exposes an in-process [`crate::broker::Broker`] over the newline-delimited JSON
//! protocol in [`crate::wire`]. Each accepted connection gets its own task; frames on
//! one connection are processed strictly in order.

mod connection;
mod listener;

pub use listener::BrokerServer;

/// Version string sent in Info frames
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
