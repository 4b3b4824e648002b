//! Main Broker task implementation

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::config::BrokerConfig;
use super::handle::BrokerHandle;
use super::messages::{BrokerMetrics, BrokerRequest};
use crate::message::Message;
use crate::transport::MessageHandler;

/// Subscription registry owned by the broker task
#[derive(Default)]
struct Registry {
    /// subject -> sid -> handler
    by_subject: HashMap<String, HashMap<String, Arc<dyn MessageHandler>>>,
    /// sid -> subject
    subjects: HashMap<String, String>,
}

impl Registry {
    fn insert(&mut self, sid: String, subject: String, handler: Arc<dyn MessageHandler>) {
        self.by_subject
            .entry(subject.clone())
            .or_default()
            .insert(sid.clone(), handler);
        self.subjects.insert(sid, subject);
    }

    fn remove(&mut self, sid: &str) -> bool {
        let Some(subject) = self.subjects.remove(sid) else {
            return false;
        };
        if let Some(handlers) = self.by_subject.get_mut(&subject) {
            handlers.remove(sid);
            if handlers.is_empty() {
                self.by_subject.remove(&subject);
            }
        }
        true
    }

    fn matching(&self, subject: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.by_subject
            .get(subject)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.subjects.len()
    }
}

/// The Broker routes published messages to subscriptions
///
/// Each matching subscription receives the message on its own spawned task, so
/// handlers run concurrently with each other and with the broker loop.
pub struct Broker {
    config: BrokerConfig,
    tx: mpsc::Sender<BrokerRequest>,
    rx: mpsc::Receiver<BrokerRequest>,
}

impl Broker {
    /// Create a new Broker with the given configuration
    pub fn new(config: BrokerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
        Self { config, tx, rx }
    }

    /// Get a sender for raw requests
    pub fn sender(&self) -> mpsc::Sender<BrokerRequest> {
        self.tx.clone()
    }

    /// Create a transport handle bound to this broker
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(
            self.tx.clone(),
            self.config.inbox_prefix.clone(),
            self.config.max_payload_bytes,
        )
    }

    /// Spawn the broker task and return a handle to it
    pub fn spawn(config: BrokerConfig) -> (BrokerHandle, tokio::task::JoinHandle<()>) {
        let broker = Self::new(config);
        let handle = broker.handle();
        let task = tokio::spawn(broker.run());
        (handle, task)
    }

    /// Run the Broker task
    ///
    /// This consumes the Broker and runs until shutdown is requested.
    pub async fn run(mut self) {
        let mut registry = Registry::default();
        let mut metrics = BrokerMetrics::default();

        info!("Broker started");

        while let Some(req) = self.rx.recv().await {
            metrics.requests_received += 1;

            match req {
                BrokerRequest::Subscribe {
                    sid,
                    subject,
                    handler,
                    ack,
                } => {
                    debug!(%sid, %subject, "Subscribing");
                    registry.insert(sid, subject, handler);
                    metrics.subscriptions = registry.len();
                    let _ = ack.send(());
                }

                BrokerRequest::Unsubscribe { sid, ack } => {
                    let removed = registry.remove(&sid);
                    debug!(%sid, removed, "Unsubscribing");
                    metrics.subscriptions = registry.len();
                    let _ = ack.send(removed);
                }

                BrokerRequest::Publish { msg } => {
                    metrics.published += 1;
                    let handlers = registry.matching(&msg.subject);

                    if handlers.is_empty() {
                        debug!(subject = %msg.subject, "No subscribers for message");
                        metrics.undeliverable += 1;
                        continue;
                    }

                    debug!(
                        subject = %msg.subject,
                        reply = ?msg.reply,
                        subscribers = handlers.len(),
                        "Routing message"
                    );
                    metrics.delivered += handlers.len() as u64;
                    deliver(handlers, msg);
                }

                BrokerRequest::Flush { ack } => {
                    let _ = ack.send(());
                }

                BrokerRequest::GetMetrics { reply_tx } => {
                    let _ = reply_tx.send(metrics.clone());
                }

                BrokerRequest::Shutdown => {
                    info!("Broker shutting down");
                    break;
                }
            }
        }

        info!(subscriptions = registry.len(), "Broker stopped");
    }
}

fn deliver(handlers: Vec<Arc<dyn MessageHandler>>, msg: Message) {
    for handler in handlers {
        let msg = msg.clone();
        tokio::spawn(async move { handler.handle(msg).await });
    }
}
