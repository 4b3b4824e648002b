//! ReplyCollector - one scatter-gather round per call

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::session::{AggregationSession, SessionState};
use super::sink::ReplySink;
use crate::error::{GatherError, GatherResult};
use crate::message::{Headers, Message, Reply, Request};
use crate::queue::{DEFAULT_SIGNAL_CAPACITY, Pop, SignalConsumer, SignalProducer, signal_queue};
use crate::transport::{MessageHandler, SubscriptionHandle, Transport};

/// Parameters for one round
#[derive(Debug, Clone)]
pub struct GatherRequest {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub max_replies: usize,
    pub window: Duration,
}

impl GatherRequest {
    /// One reply within two seconds, like the CLI defaults
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
            max_replies: 1,
            window: Duration::from_secs(2),
        }
    }

    pub fn max_replies(mut self, max_replies: usize) -> Self {
        self.max_replies = max_replies;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }
}

/// How a round ended
#[derive(Debug, Clone, Serialize)]
pub struct GatherReport {
    #[serde(rename = "reply-address")]
    pub reply_address: String,
    pub received: usize,
    #[serde(rename = "max-replies")]
    pub max_replies: usize,
    pub state: SessionState,
    pub elapsed: Duration,
}

impl GatherReport {
    /// Fewer replies than asked for, without an error
    pub fn is_partial(&self) -> bool {
        self.received < self.max_replies
    }
}

/// Subscription callback: turns deliveries into queued replies
struct ReplyHandler {
    producer: SignalProducer<Reply>,
}

#[async_trait]
impl MessageHandler for ReplyHandler {
    async fn handle(&self, msg: Message) {
        let reply = Reply::from_message(msg);
        if self.producer.push(reply).await.is_err() {
            debug!("ReplyHandler: session over, dropping late reply");
        }
    }
}

/// Runs scatter-gather rounds over a transport
///
/// Each round subscribes to a fresh reply address before publishing, then counts
/// replies until `max_replies` arrive or the window closes. Counted replies are
/// forwarded to the sink from the counting loop, so a reply is forwarded if and
/// only if it was counted.
#[derive(Clone)]
pub struct ReplyCollector {
    transport: Arc<dyn Transport>,
    signal_capacity: usize,
}

impl ReplyCollector {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
        }
    }

    /// Override the bounded queue capacity
    pub fn with_signal_capacity(mut self, capacity: usize) -> Self {
        self.signal_capacity = capacity.max(1);
        self
    }

    /// Publish `payload` on `subject` and count replies
    ///
    /// Returns the number of replies received, which is below `max_replies` when
    /// the window closed first.
    pub async fn run(
        &self,
        subject: &str,
        payload: impl Into<Vec<u8>>,
        max_replies: usize,
        window: Duration,
        sink: Arc<dyn ReplySink>,
    ) -> GatherResult<usize> {
        let request = GatherRequest::new(subject, payload)
            .max_replies(max_replies)
            .window(window);
        let report = self.gather(request, sink, None).await?;
        Ok(report.received)
    }

    /// Full round with headers and an optional cooperative shutdown
    ///
    /// Setting the shutdown watch to `true` ends the round as `Expired`. If the
    /// transport drops the reply subscription mid-round, the round ends as
    /// `Failed` with a transport error.
    pub async fn gather(
        &self,
        request: GatherRequest,
        sink: Arc<dyn ReplySink>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> GatherResult<GatherReport> {
        debug!(
            subject = %request.subject,
            max_replies = request.max_replies,
            window = ?request.window,
            "ReplyCollector::gather: called"
        );
        if request.max_replies == 0 {
            return Err(GatherError::InvalidArgument(
                "max replies must be at least 1".to_string(),
            ));
        }

        let started = Instant::now();
        let reply_address = self.transport.new_reply_address()?;

        let (producer, mut consumer) = signal_queue(self.signal_capacity);
        let handler = Arc::new(ReplyHandler { producer });
        let subscription = self.transport.subscribe(&reply_address, handler).await?;

        let GatherRequest {
            subject,
            payload,
            headers,
            max_replies,
            window,
        } = request;
        let request = Request::new(subject, reply_address.clone(), payload, headers);
        let mut session = AggregationSession::new(reply_address, max_replies, window, started);

        if let Err(e) = self.transport.publish(request.to_message()).await {
            warn!(subject = %request.subject(), error = %e, "Publish failed");
            session.fail();
            consumer.close();
            self.release(&subscription).await;
            return Err(e);
        }
        info!(subject = %request.subject(), reply = %request.reply_address(), "Published request");

        race(&mut session, &mut consumer, sink.as_ref(), shutdown).await;

        consumer.close();
        self.release(&subscription).await;

        if session.state() == SessionState::Failed {
            return Err(GatherError::Transport(format!(
                "reply subscription on {} ended after {} of {} replies",
                session.reply_address(),
                session.received(),
                session.max_replies()
            )));
        }

        let report = GatherReport {
            reply_address: session.reply_address().to_string(),
            received: session.received(),
            max_replies: session.max_replies(),
            state: session.state(),
            elapsed: session.elapsed(),
        };
        info!(
            received = report.received,
            max_replies = report.max_replies,
            state = %report.state,
            elapsed = ?report.elapsed,
            "Gather finished"
        );
        Ok(report)
    }

    async fn release(&self, subscription: &SubscriptionHandle) {
        if let Err(e) = self.transport.unsubscribe(subscription).await {
            warn!(sid = %subscription.id(), error = %e, "Failed to unsubscribe reply address");
        }
    }
}

/// Count replies until the session leaves `Listening`
async fn race(
    session: &mut AggregationSession,
    consumer: &mut SignalConsumer<Reply>,
    sink: &dyn ReplySink,
    mut shutdown: Option<watch::Receiver<bool>>,
) {
    while session.is_active() {
        let Some(remaining) = session.remaining(Instant::now()) else {
            session.expire();
            break;
        };

        let popped = match shutdown.as_mut() {
            Some(rx) => {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(rx) => {
                        info!("Shutdown requested, ending gather early");
                        session.expire();
                        break;
                    }
                    popped = consumer.pop(remaining) => popped,
                }
            }
            None => consumer.pop(remaining).await,
        };

        match popped {
            Pop::Signal(reply) => {
                session.record_reply();
                debug!(received = session.received(), "Reply counted");
                sink.accept(reply);
            }
            Pop::Timeout => session.expire(),
            Pop::Closed => {
                warn!(received = session.received(), "Reply subscription closed by transport");
                session.fail();
            }
        }
    }
}

/// Resolve when the watch flips to true; never if the sender goes away first
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig, BrokerHandle};
    use crate::collector::sink::{CollectingSink, NullSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request on a subject `copies` times after `delay`
    struct Echo {
        transport: BrokerHandle,
        delay: Duration,
        copies: usize,
    }

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, msg: Message) {
            tokio::time::sleep(self.delay).await;
            if let Some(reply) = msg.reply {
                for _ in 0..self.copies {
                    let _ = self.transport.publish(Message::new(reply.clone(), "pong")).await;
                }
            }
        }
    }

    async fn echo(handle: &BrokerHandle, subject: &str, delay: Duration, copies: usize) {
        let responder = Echo {
            transport: handle.clone(),
            delay,
            copies,
        };
        handle.subscribe(subject, Arc::new(responder)).await.unwrap();
    }

    /// Transport whose operations can be made to fail
    #[derive(Default)]
    struct Faulty {
        fail_address: bool,
        fail_publish: bool,
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
        publishes: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Faulty {
        fn new_reply_address(&self) -> GatherResult<String> {
            if self.fail_address {
                return Err(GatherError::AddressGeneration("no connection".to_string()));
            }
            Ok("_INBOX.faulty".to_string())
        }

        async fn subscribe(&self, subject: &str, _handler: Arc<dyn MessageHandler>) -> GatherResult<SubscriptionHandle> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(SubscriptionHandle::new("sid", subject))
        }

        async fn unsubscribe(&self, _handle: &SubscriptionHandle) -> GatherResult<()> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, msg: Message) -> GatherResult<()> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            if self.fail_publish {
                return Err(GatherError::Publish {
                    subject: msg.subject,
                    message: "no connectivity".to_string(),
                });
            }
            Ok(())
        }

        async fn flush(&self) -> GatherResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_reached_before_window() {
        let (handle, _task) = Broker::spawn(BrokerConfig::default());
        for _ in 0..3 {
            echo(&handle, "svc.echo", Duration::from_millis(200), 1).await;
        }

        let collector = ReplyCollector::new(Arc::new(handle.clone()));
        let sink = Arc::new(CollectingSink::new());
        let start = Instant::now();
        let received = collector
            .run("svc.echo", "ping", 3, Duration::from_secs(2), sink.clone())
            .await
            .unwrap();

        assert_eq!(received, 3);
        assert_eq!(sink.len(), 3);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires_with_partial_results() {
        let (handle, _task) = Broker::spawn(BrokerConfig::default());
        echo(&handle, "svc.echo", Duration::from_millis(50), 1).await;
        echo(&handle, "svc.echo", Duration::from_millis(80), 1).await;

        let collector = ReplyCollector::new(Arc::new(handle.clone()));
        let request = GatherRequest::new("svc.echo", "ping")
            .max_replies(5)
            .window(Duration::from_secs(1));
        let report = collector.gather(request, Arc::new(NullSink), None).await.unwrap();

        assert_eq!(report.received, 2);
        assert_eq!(report.state, SessionState::Expired);
        assert!(report.is_partial());
        assert!(report.elapsed >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_replies_waits_full_window() {
        let (handle, _task) = Broker::spawn(BrokerConfig::default());
        let collector = ReplyCollector::new(Arc::new(handle.clone()));

        let start = Instant::now();
        let received = collector
            .run("svc.nobody", "ping", 1, Duration::from_millis(750), Arc::new(NullSink))
            .await
            .unwrap();

        assert_eq!(received, 0);
        assert!(start.elapsed() >= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_replies_are_not_counted() {
        let (handle, _task) = Broker::spawn(BrokerConfig::default());
        echo(&handle, "svc.echo", Duration::from_millis(10), 5).await;

        let collector = ReplyCollector::new(Arc::new(handle.clone()));
        let sink = Arc::new(CollectingSink::new());
        let received = collector
            .run("svc.echo", "ping", 2, Duration::from_secs(1), sink.clone())
            .await
            .unwrap();

        assert_eq!(received, 2);
        assert_eq!(sink.len(), 2);

        // Reply address is released before run returns
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.len(), 2);
        assert_eq!(handle.metrics().await.unwrap().subscriptions, 1);
    }

    #[tokio::test]
    async fn test_zero_max_replies_is_rejected_before_io() {
        let transport = Arc::new(Faulty::default());
        let collector = ReplyCollector::new(transport.clone());

        let err = collector
            .run("svc.echo", "ping", 0, Duration::from_secs(1), Arc::new(NullSink))
            .await
            .unwrap_err();

        assert!(err.is_invalid_argument());
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 0);
        assert_eq!(transport.publishes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_window_returns_immediately() {
        let transport = Arc::new(Faulty::default());
        let collector = ReplyCollector::new(transport.clone());

        let report = collector
            .gather(
                GatherRequest::new("svc.echo", "ping").window(Duration::ZERO),
                Arc::new(NullSink),
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.received, 0);
        assert_eq!(report.state, SessionState::Expired);
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_address_failure_is_fatal() {
        let transport = Arc::new(Faulty {
            fail_address: true,
            ..Default::default()
        });
        let collector = ReplyCollector::new(transport.clone());

        let err = collector
            .run("svc.echo", "ping", 1, Duration::from_secs(1), Arc::new(NullSink))
            .await
            .unwrap_err();

        assert!(matches!(err, GatherError::AddressGeneration(_)));
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_releases_subscription() {
        let transport = Arc::new(Faulty {
            fail_publish: true,
            ..Default::default()
        });
        let collector = ReplyCollector::new(transport.clone());

        let err = collector
            .run("svc.echo", "ping", 1, Duration::from_secs(1), Arc::new(NullSink))
            .await
            .unwrap_err();

        assert!(matches!(err, GatherError::Publish { .. }));
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.publishes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_round_early() {
        let (handle, _task) = Broker::spawn(BrokerConfig::default());
        let collector = ReplyCollector::new(Arc::new(handle.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = stop_tx.send(true);
        });

        let start = Instant::now();
        let report = collector
            .gather(
                GatherRequest::new("svc.nobody", "ping").window(Duration::from_secs(10)),
                Arc::new(NullSink),
                Some(stop_rx),
            )
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Expired);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    /// Transport that forgets its subscribers `after` a delay, like a dropped connection
    struct Dropping {
        after: Duration,
    }

    #[async_trait]
    impl Transport for Dropping {
        fn new_reply_address(&self) -> GatherResult<String> {
            Ok("_INBOX.dropping".to_string())
        }

        async fn subscribe(&self, subject: &str, handler: Arc<dyn MessageHandler>) -> GatherResult<SubscriptionHandle> {
            let after = self.after;
            tokio::spawn(async move {
                handler.handle(Message::new("_INBOX.dropping", "first")).await;
                tokio::time::sleep(after).await;
                drop(handler);
            });
            Ok(SubscriptionHandle::new("sid", subject))
        }

        async fn unsubscribe(&self, _handle: &SubscriptionHandle) -> GatherResult<()> {
            Ok(())
        }

        async fn publish(&self, _msg: Message) -> GatherResult<()> {
            Ok(())
        }

        async fn flush(&self) -> GatherResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_subscription_fails_round() {
        let collector = ReplyCollector::new(Arc::new(Dropping {
            after: Duration::from_millis(100),
        }));
        let sink = Arc::new(CollectingSink::new());

        let start = Instant::now();
        let err = collector
            .run("svc.echo", "ping", 3, Duration::from_secs(10), sink.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, GatherError::Transport(_)));
        assert!(err.to_string().contains("1 of 3"));
        assert_eq!(sink.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_stopping_mid_round_fails_round() {
        let (handle, _task) = Broker::spawn(BrokerConfig::default());
        let collector = ReplyCollector::new(Arc::new(handle.clone()));

        let stopper = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = stopper.shutdown().await;
        });

        let start = Instant::now();
        let err = collector
            .run("svc.nobody", "ping", 1, Duration::from_secs(10), Arc::new(NullSink))
            .await
            .unwrap_err();

        assert!(matches!(err, GatherError::Transport(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_beyond_capacity_is_not_lost() {
        let (handle, _task) = Broker::spawn(BrokerConfig::default());
        echo(&handle, "svc.burst", Duration::ZERO, 40).await;

        let collector = ReplyCollector::new(Arc::new(handle.clone())).with_signal_capacity(4);
        let received = collector
            .run("svc.burst", "ping", 40, Duration::from_secs(5), Arc::new(NullSink))
            .await
            .unwrap();

        assert_eq!(received, 40);
    }
}
