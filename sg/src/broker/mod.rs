//! In-process message broker
//!
//! The Broker is an actor task that owns the subscription registry. Clients talk to
//! it through a cloneable [`BrokerHandle`], which implements
//! [`crate::transport::Transport`]:
//! - **Subscribe:** register a handler for an exact subject
//! - **Publish:** route a message to every handler on its subject
//! - **Unsubscribe:** idempotent removal

mod config;
mod core;
mod handle;
mod messages;

pub use config::BrokerConfig;
pub use core::Broker;
pub use handle::BrokerHandle;
pub use messages::{BrokerMetrics, BrokerRequest};
