//! Pub/sub transport contract
//!
//! The collector and responder only talk to a [`Transport`]. Two implementations ship
//! with the crate:
//! - [`crate::broker::BrokerHandle`] - in-process broker actor
//! - [`RemoteTransport`] - TCP client for a `sg serve` broker

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;

use crate::error::GatherResult;
use crate::message::Message;

mod remote;

pub use remote::{Credentials, RemoteTransport, RemoteTransportConfig};

/// Prefix for generated reply addresses
pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

/// Random characters in a reply address token
const INBOX_TOKEN_LEN: usize = 22;

/// Callback invoked once per delivered message
///
/// Transports call handlers from their own tasks, possibly several at once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: Message);
}

/// Identifies one live subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: String,
    subject: String,
}

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Connection to a pub/sub system
#[async_trait]
pub trait Transport: Send + Sync {
    /// Mint a reply address no other caller will be handed
    fn new_reply_address(&self) -> GatherResult<String>;

    /// Register `handler` for messages published on `subject`
    ///
    /// The subscription is live once this returns.
    async fn subscribe(&self, subject: &str, handler: Arc<dyn MessageHandler>) -> GatherResult<SubscriptionHandle>;

    /// Remove a subscription; calling it again for the same handle is a no-op
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatherResult<()>;

    /// Publish a message, best effort
    async fn publish(&self, msg: Message) -> GatherResult<()>;

    /// Resolve once every operation issued before it has been processed
    async fn flush(&self) -> GatherResult<()>;
}

/// Generate `<prefix>.<22 random alphanumerics>`
pub fn generate_reply_address(prefix: &str) -> String {
    let token: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(INBOX_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("{}.{}", prefix, token)
}
