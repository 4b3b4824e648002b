//! BrokerHandle - in-process transport backed by the Broker task

use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Result, eyre};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::messages::{BrokerMetrics, BrokerRequest};
use crate::error::{GatherError, GatherResult};
use crate::message::Message;
use crate::transport::{MessageHandler, SubscriptionHandle, Transport, generate_reply_address};

/// Handle for publishing and subscribing through an in-process Broker
///
/// This handle is cloneable; every clone talks to the same broker task.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    /// Sender to the Broker task
    tx: mpsc::Sender<BrokerRequest>,
    inbox_prefix: String,
    max_payload_bytes: usize,
}

impl BrokerHandle {
    pub(crate) fn new(tx: mpsc::Sender<BrokerRequest>, inbox_prefix: String, max_payload_bytes: usize) -> Self {
        debug!(%inbox_prefix, max_payload_bytes, "BrokerHandle::new: called");
        Self {
            tx,
            inbox_prefix,
            max_payload_bytes,
        }
    }

    /// True once the broker task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get current broker metrics
    pub async fn metrics(&self) -> Result<BrokerMetrics> {
        debug!("BrokerHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(BrokerRequest::GetMetrics { reply_tx })
            .await
            .map_err(|_| eyre!("Broker channel closed"))?;

        reply_rx.await.map_err(|_| eyre!("Broker shutdown before reply"))
    }

    /// Request shutdown of the Broker
    pub async fn shutdown(&self) -> Result<()> {
        debug!("BrokerHandle::shutdown: called");
        self.tx
            .send(BrokerRequest::Shutdown)
            .await
            .map_err(|_| eyre!("Broker channel closed"))?;

        Ok(())
    }
}

#[async_trait]
impl Transport for BrokerHandle {
    fn new_reply_address(&self) -> GatherResult<String> {
        if self.tx.is_closed() {
            return Err(GatherError::AddressGeneration("broker is not running".to_string()));
        }
        Ok(generate_reply_address(&self.inbox_prefix))
    }

    async fn subscribe(&self, subject: &str, handler: Arc<dyn MessageHandler>) -> GatherResult<SubscriptionHandle> {
        let sid = Uuid::now_v7().to_string();
        debug!(%sid, %subject, "BrokerHandle::subscribe: called");
        let (ack, ack_rx) = oneshot::channel();
        let closed = || GatherError::Subscribe {
            subject: subject.to_string(),
            message: "broker channel closed".to_string(),
        };

        self.tx
            .send(BrokerRequest::Subscribe {
                sid: sid.clone(),
                subject: subject.to_string(),
                handler,
                ack,
            })
            .await
            .map_err(|_| closed())?;
        ack_rx.await.map_err(|_| closed())?;

        debug!(%sid, "BrokerHandle::subscribe: registered");
        Ok(SubscriptionHandle::new(sid, subject))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatherResult<()> {
        debug!(sid = %handle.id(), subject = %handle.subject(), "BrokerHandle::unsubscribe: called");
        let (ack, ack_rx) = oneshot::channel();

        let sent = self
            .tx
            .send(BrokerRequest::Unsubscribe {
                sid: handle.id().to_string(),
                ack,
            })
            .await;
        if sent.is_err() {
            // A stopped broker holds no subscriptions
            debug!("BrokerHandle::unsubscribe: broker already stopped");
            return Ok(());
        }

        match ack_rx.await {
            Ok(true) => debug!("BrokerHandle::unsubscribe: removed"),
            Ok(false) => debug!("BrokerHandle::unsubscribe: already removed"),
            Err(_) => debug!("BrokerHandle::unsubscribe: broker stopped before ack"),
        }
        Ok(())
    }

    async fn publish(&self, msg: Message) -> GatherResult<()> {
        debug!(subject = %msg.subject, reply = ?msg.reply, "BrokerHandle::publish: called");
        if msg.payload.len() > self.max_payload_bytes {
            return Err(GatherError::Publish {
                subject: msg.subject,
                message: format!(
                    "payload of {} bytes exceeds limit of {} bytes",
                    msg.payload.len(),
                    self.max_payload_bytes
                ),
            });
        }

        let subject = msg.subject.clone();
        self.tx
            .send(BrokerRequest::Publish { msg })
            .await
            .map_err(|_| GatherError::Publish {
                subject,
                message: "broker channel closed".to_string(),
            })
    }

    async fn flush(&self) -> GatherResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(BrokerRequest::Flush { ack })
            .await
            .map_err(|_| GatherError::Transport("broker channel closed".to_string()))?;
        ack_rx
            .await
            .map_err(|_| GatherError::Transport("broker shutdown before flush".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};

    struct Ignore;

    #[async_trait]
    impl MessageHandler for Ignore {
        async fn handle(&self, _msg: Message) {}
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_ok() {
        let (handle, task) = Broker::spawn(BrokerConfig::default());

        let sub = handle.subscribe("svc.echo", Arc::new(Ignore)).await.unwrap();
        assert_eq!(handle.metrics().await.unwrap().subscriptions, 1);

        handle.unsubscribe(&sub).await.unwrap();
        handle.unsubscribe(&sub).await.unwrap();
        assert_eq!(handle.metrics().await.unwrap().subscriptions, 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_shutdown() {
        let (handle, task) = Broker::spawn(BrokerConfig::default());
        let sub = handle.subscribe("svc.echo", Arc::new(Ignore)).await.unwrap();

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(handle.is_closed());
        assert!(matches!(
            handle.new_reply_address(),
            Err(GatherError::AddressGeneration(_))
        ));
        assert!(matches!(
            handle.publish(Message::new("svc.echo", "ping")).await,
            Err(GatherError::Publish { .. })
        ));
        assert!(matches!(
            handle.subscribe("svc.echo", Arc::new(Ignore)).await,
            Err(GatherError::Subscribe { .. })
        ));
        handle.unsubscribe(&sub).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_rejects_oversized_payload() {
        let config = BrokerConfig {
            max_payload_bytes: 4,
            ..Default::default()
        };
        let (handle, _task) = Broker::spawn(config);

        let err = handle.publish(Message::new("svc.echo", "too large")).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_reply_address_uses_prefix() {
        let config = BrokerConfig {
            inbox_prefix: "_REPLY".to_string(),
            ..Default::default()
        };
        let (handle, _task) = Broker::spawn(config);

        assert!(handle.new_reply_address().unwrap().starts_with("_REPLY."));
        handle.flush().await.unwrap();
    }
}
