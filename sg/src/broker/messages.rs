//! Message types for the Broker actor

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::message::Message;
use crate::transport::MessageHandler;

/// Internal requests to the Broker task
pub enum BrokerRequest {
    /// Register a handler for a subject
    Subscribe {
        sid: String,
        subject: String,
        handler: Arc<dyn MessageHandler>,
        ack: oneshot::Sender<()>,
    },

    /// Remove a subscription; replies whether it existed
    Unsubscribe { sid: String, ack: oneshot::Sender<bool> },

    /// Route a message to every subscription on its subject
    Publish { msg: Message },

    /// Acknowledge once every earlier request was processed
    Flush { ack: oneshot::Sender<()> },

    /// Get current metrics
    GetMetrics { reply_tx: oneshot::Sender<BrokerMetrics> },

    /// Shutdown the broker
    Shutdown,
}

impl fmt::Debug for BrokerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe { sid, subject, .. } => f
                .debug_struct("Subscribe")
                .field("sid", sid)
                .field("subject", subject)
                .finish_non_exhaustive(),
            Self::Unsubscribe { sid, .. } => f.debug_struct("Unsubscribe").field("sid", sid).finish_non_exhaustive(),
            Self::Publish { msg } => f.debug_struct("Publish").field("subject", &msg.subject).finish(),
            Self::Flush { .. } => write!(f, "Flush"),
            Self::GetMetrics { .. } => write!(f, "GetMetrics"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Broker metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMetrics {
    pub subscriptions: usize,
    pub published: u64,
    pub delivered: u64,
    /// Published messages that matched no subscription
    pub undeliverable: u64,
    pub requests_received: u64,
}
