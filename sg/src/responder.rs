//! Responder - answers every request on a subject

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatherResult;
use crate::message::Message;
use crate::transport::{MessageHandler, SubscriptionHandle, Transport};

/// Header naming the responder on each reply
pub const RESPONDER_HEADER: &str = "Responder";

/// Header carrying the responder's instance id
pub const RESPONDER_ID_HEADER: &str = "Responder-Id";

struct Answer {
    transport: Arc<dyn Transport>,
    name: String,
    id: String,
    response: Vec<u8>,
    delay: Duration,
    served: Arc<AtomicU64>,
}

#[async_trait]
impl MessageHandler for Answer {
    async fn handle(&self, msg: Message) {
        let Some(reply) = msg.reply else {
            debug!(subject = %msg.subject, "Answer: request has no reply address, ignoring");
            return;
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let response = Message::new(reply, self.response.clone())
            .with_header(RESPONDER_HEADER, self.name.clone())
            .with_header(RESPONDER_ID_HEADER, self.id.clone());
        match self.transport.publish(response).await {
            Ok(()) => {
                self.served.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "Failed to publish response"),
        }
    }
}

/// Service answering requests on one subject with a fixed payload
///
/// Name and delay changes take effect on the next `start`.
pub struct Responder {
    transport: Arc<dyn Transport>,
    subject: String,
    name: String,
    id: String,
    response: Vec<u8>,
    delay: Duration,
    served: Arc<AtomicU64>,
    subscription: Option<SubscriptionHandle>,
}

impl Responder {
    pub fn new(transport: Arc<dyn Transport>, subject: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
        let subject = subject.into();
        debug!(%subject, "Responder::new: called");
        Self {
            transport,
            name: subject.clone(),
            id: Uuid::now_v7().to_string(),
            response: response.into(),
            delay: Duration::ZERO,
            served: Arc::new(AtomicU64::new(0)),
            subject,
            subscription: None,
        }
    }

    /// Name sent in the Responder header; defaults to the subject
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Wait this long before each response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Number of responses published so far
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe and start answering; a no-op when already running
    pub async fn start(&mut self) -> GatherResult<()> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let handler: Arc<dyn MessageHandler> = Arc::new(Answer {
            transport: self.transport.clone(),
            name: self.name.clone(),
            id: self.id.clone(),
            response: self.response.clone(),
            delay: self.delay,
            served: self.served.clone(),
        });
        let handle = self.transport.subscribe(&self.subject, handler).await?;
        info!(subject = %self.subject, name = %self.name, id = %self.id, "Responder started");
        self.subscription = Some(handle);
        Ok(())
    }

    /// Stop answering; a no-op when not running
    pub async fn stop(&mut self) -> GatherResult<()> {
        let Some(handle) = self.subscription.take() else {
            return Ok(());
        };
        self.transport.unsubscribe(&handle).await?;
        info!(subject = %self.subject, served = self.served(), "Responder stopped");
        Ok(())
    }
}
