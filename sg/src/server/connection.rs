//! One client connection on the broker server

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SERVER_VERSION;
use crate::broker::BrokerHandle;
use crate::message::Message;
use crate::transport::{MessageHandler, SubscriptionHandle, Transport};
use crate::wire::{ClientFrame, FrameError, FrameReader, ServerFrame, write_frame};

/// Outbound frames buffered per connection before deliveries wait
const OUTBOUND_BUFFER: usize = 1024;

/// How long a rejected connection waits for the peer to hang up
const REJECT_LINGER: Duration = Duration::from_secs(1);

/// Forwards broker deliveries for one client sid onto the connection
struct Forwarder {
    sid: String,
    out: mpsc::Sender<ServerFrame>,
}

#[async_trait]
impl MessageHandler for Forwarder {
    async fn handle(&self, msg: Message) {
        if self.out.send(ServerFrame::deliver(self.sid.clone(), msg)).await.is_err() {
            debug!(sid = %self.sid, "Forwarder: connection gone, dropping delivery");
        }
    }
}

/// Settings shared by every connection
#[derive(Debug, Clone)]
pub(super) struct ConnectionContext {
    pub server_id: String,
    pub auth_token: Option<String>,
    pub max_payload_bytes: usize,
    pub max_frame_bytes: usize,
    pub broker: BrokerHandle,
}

/// Serve one accepted connection until the peer leaves or breaks protocol
pub(super) async fn serve(stream: TcpStream, ctx: Arc<ConnectionContext>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!(%peer, "serve: called");

    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                debug!(error = %e, "Connection writer stopped");
                break;
            }
        }
    });

    let info = ServerFrame::Info {
        server_id: ctx.server_id.clone(),
        version: SERVER_VERSION.to_string(),
        max_payload: ctx.max_payload_bytes,
    };
    let mut reader = FrameReader::new(read_half, ctx.max_frame_bytes);
    let accepted = match out_tx.send(info).await {
        Ok(()) => handshake(&mut reader, &ctx, &out_tx).await,
        Err(_) => None,
    };

    let rejected = accepted.is_none();
    match accepted {
        Some(name) => {
            info!(%peer, %name, "Client connected");
            let mut session = Session {
                ctx: ctx.clone(),
                out: out_tx.clone(),
                subscriptions: HashMap::new(),
            };
            session.run(&mut reader).await;
            session.release().await;
            info!(%peer, %name, "Client disconnected");
        }
        None => debug!(%peer, "Handshake failed"),
    }

    // Writer drains whatever is queued, then exits once every sender is gone
    drop(out_tx);
    let _ = writer.await;

    if rejected {
        // Let the peer read the Err frame before the socket goes away
        let _ = tokio::time::timeout(REJECT_LINGER, async {
            while let Ok(Some(_)) = reader.read_frame::<ClientFrame>().await {}
        })
        .await;
    }
}

/// Expect Connect as the first frame and check the token
async fn handshake(
    reader: &mut FrameReader<OwnedReadHalf>,
    ctx: &ConnectionContext,
    out: &mpsc::Sender<ServerFrame>,
) -> Option<String> {
    let frame = match reader.read_frame::<ClientFrame>().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(e) => {
            let _ = out.send(ServerFrame::err(e.to_string())).await;
            return None;
        }
    };

    let ClientFrame::Connect { name, token } = frame else {
        let _ = out.send(ServerFrame::err("expected Connect as first frame")).await;
        return None;
    };

    if let Some(expected) = &ctx.auth_token {
        if token.as_deref() != Some(expected.as_str()) {
            warn!(%name, "Rejected client with bad token");
            let _ = out.send(ServerFrame::err("authorization violation")).await;
            return None;
        }
    }

    Some(name)
}

/// Per-connection subscription state
struct Session {
    ctx: Arc<ConnectionContext>,
    out: mpsc::Sender<ServerFrame>,
    /// client sid -> broker subscription
    subscriptions: HashMap<String, SubscriptionHandle>,
}

impl Session {
    async fn run(&mut self, reader: &mut FrameReader<OwnedReadHalf>) {
        loop {
            let frame = match reader.read_frame::<ClientFrame>().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Ignoring malformed frame");
                    self.reply(ServerFrame::err(e.to_string())).await;
                    continue;
                }
                Err(e) => {
                    if matches!(e, FrameError::TooLarge { .. }) {
                        self.reply(ServerFrame::err(e.to_string())).await;
                    }
                    debug!(error = %e, "Session::run: read failed");
                    break;
                }
            };

            if !self.process(frame).await {
                break;
            }
        }
    }

    /// Handle one frame; false closes the connection
    async fn process(&mut self, frame: ClientFrame) -> bool {
        match frame {
            ClientFrame::Connect { .. } => {
                self.reply(ServerFrame::err("already connected")).await;
            }

            ClientFrame::Sub { sid, subject } => {
                if self.subscriptions.contains_key(&sid) {
                    self.reply(ServerFrame::err(format!("duplicate sid {}", sid))).await;
                    return true;
                }
                let forwarder = Arc::new(Forwarder {
                    sid: sid.clone(),
                    out: self.out.clone(),
                });
                match self.ctx.broker.subscribe(&subject, forwarder).await {
                    Ok(handle) => {
                        debug!(%sid, %subject, "Client subscribed");
                        self.subscriptions.insert(sid, handle);
                    }
                    Err(e) => {
                        self.reply(ServerFrame::err(e.to_string())).await;
                        return false;
                    }
                }
            }

            ClientFrame::Unsub { sid } => {
                if let Some(handle) = self.subscriptions.remove(&sid) {
                    if let Err(e) = self.ctx.broker.unsubscribe(&handle).await {
                        debug!(%sid, error = %e, "Broker unsubscribe failed");
                    }
                } else {
                    debug!(%sid, "Unsub for unknown sid");
                }
            }

            ClientFrame::Pub {
                subject,
                reply,
                headers,
                payload,
            } => {
                let msg = Message {
                    subject,
                    reply,
                    headers,
                    payload,
                };
                if let Err(e) = self.ctx.broker.publish(msg).await {
                    warn!(error = %e, "Publish rejected");
                    self.reply(ServerFrame::err(e.to_string())).await;
                }
            }

            ClientFrame::Ping => {
                if let Err(e) = self.ctx.broker.flush().await {
                    self.reply(ServerFrame::err(e.to_string())).await;
                    return false;
                }
                self.reply(ServerFrame::Pong).await;
            }
        }
        true
    }

    async fn reply(&self, frame: ServerFrame) {
        let _ = self.out.send(frame).await;
    }

    /// Drop every broker subscription this connection made
    async fn release(&mut self) {
        for (sid, handle) in self.subscriptions.drain() {
            debug!(%sid, "Releasing subscription");
            if let Err(e) = self.ctx.broker.unsubscribe(&handle).await {
                debug!(%sid, error = %e, "Broker unsubscribe failed during release");
            }
        }
    }
}
