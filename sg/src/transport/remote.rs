//! RemoteTransport - TCP client for a `sg serve` broker

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DEFAULT_INBOX_PREFIX, MessageHandler, SubscriptionHandle, Transport, generate_reply_address};
use crate::config::{ClientConfig, DEFAULT_SERVER};
use crate::error::{GatherError, GatherResult};
use crate::message::Message;
use crate::wire::{ClientFrame, DEFAULT_MAX_FRAME_BYTES, FrameReader, ServerFrame, frame_limit, write_frame};

/// Outbound frames buffered before callers wait
const OUTBOUND_BUFFER: usize = 1024;

/// Token presented in the Connect frame
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
    source: PathBuf,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("source", &self.source)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Pick credentials from at most one of a creds file and an nkey seed file
    pub fn resolve(creds: Option<&Path>, nkey: Option<&Path>) -> Result<Option<Self>> {
        match (creds, nkey) {
            (Some(_), Some(_)) => Err(eyre!("creds and nkey are mutually exclusive")),
            (Some(path), None) => Self::from_creds_file(path).map(Some),
            (None, Some(path)) => Self::from_nkey_file(path).map(Some),
            (None, None) => Ok(None),
        }
    }

    /// Read a creds file
    ///
    /// When the file holds `-----BEGIN ...-----` blocks the first block is the
    /// token; otherwise the whole trimmed file is.
    pub fn from_creds_file(path: &Path) -> Result<Self> {
        debug!(?path, "Credentials::from_creds_file: called");
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read creds file {}", path.display()))?;
        let token = first_block(&content).unwrap_or_else(|| content.trim().to_string());
        Self::new(token, path)
    }

    /// Read an nkey seed file; the first non-empty line is the token
    pub fn from_nkey_file(path: &Path) -> Result<Self> {
        debug!(?path, "Credentials::from_nkey_file: called");
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read nkey file {}", path.display()))?;
        let token = content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();
        Self::new(token, path)
    }

    fn new(token: String, source: &Path) -> Result<Self> {
        if token.is_empty() {
            return Err(eyre!("No credentials found in {}", source.display()));
        }
        Ok(Self {
            token,
            source: source.to_path_buf(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Contents of the first `-----BEGIN` / `-----END` block, if any
fn first_block(content: &str) -> Option<String> {
    let mut lines = content.lines().map(str::trim);
    lines.find(|line| line.starts_with("-----BEGIN"))?;
    let body: Vec<&str> = lines
        .take_while(|line| !line.starts_with("-----END") && !line.starts_with("------END"))
        .filter(|line| !line.is_empty())
        .collect();
    if body.is_empty() { None } else { Some(body.concat()) }
}

/// RemoteTransport configuration
#[derive(Debug, Clone)]
pub struct RemoteTransportConfig {
    pub server: String,
    pub name: String,
    pub inbox_prefix: String,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
    pub credentials: Option<Credentials>,
}

impl Default for RemoteTransportConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            name: "sg".to_string(),
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            credentials: None,
        }
    }
}

impl From<&ClientConfig> for RemoteTransportConfig {
    fn from(client: &ClientConfig) -> Self {
        Self {
            server: client.server.clone(),
            name: client.name.clone(),
            inbox_prefix: client.inbox_prefix.clone(),
            connect_timeout: client.connect_timeout(),
            ..Default::default()
        }
    }
}

/// State shared between callers and the reader task
struct Shared {
    out: mpsc::Sender<ClientFrame>,
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
    /// One waiter per Ping in flight, in send order
    pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
    /// Held by `flush` from queueing its waiter until its Ping is sent
    ping_order: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Shared {
    fn handler(&self, sid: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sid)
            .cloned()
    }

    fn next_pong_waiter(&self) -> Option<oneshot::Sender<()>> {
        self.pongs.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Mark the connection dead and drop every handler and flush waiter
    ///
    /// Dropping the handlers closes their reply queues, so a round in progress
    /// sees the subscription end instead of waiting out its window.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handlers: Vec<_> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        self.pongs.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!(handlers = handlers.len(), "Shared::shut: released handlers");
    }
}

/// Transport speaking the broker wire protocol over TCP
///
/// Deliveries are dispatched to handlers on spawned tasks. Dropping the transport
/// closes the connection.
pub struct RemoteTransport {
    shared: Arc<Shared>,
    inbox_prefix: String,
    server_id: String,
    max_payload: usize,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteTransport {
    /// Connect, present credentials and wait for the server to accept them
    pub async fn connect(config: RemoteTransportConfig) -> GatherResult<Self> {
        debug!(server = %config.server, name = %config.name, "RemoteTransport::connect: called");
        let transport_err = |msg: String| GatherError::Transport(msg);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.server))
            .await
            .map_err(|_| transport_err(format!("Timed out connecting to {}", config.server)))?
            .map_err(|e| transport_err(format!("Failed to connect to {}: {}", config.server, e)))?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, config.max_frame_bytes);

        let handshake = async {
            let (server_id, max_payload) = match reader.read_frame::<ServerFrame>().await {
                Ok(Some(ServerFrame::Info {
                    server_id,
                    version,
                    max_payload,
                })) => {
                    debug!(%server_id, %version, max_payload, "RemoteTransport::connect: got info");
                    (server_id, max_payload)
                }
                Ok(Some(other)) => return Err(format!("Expected Info, got {:?}", other)),
                Ok(None) => return Err("Server closed connection".to_string()),
                Err(e) => return Err(e.to_string()),
            };

            let connect = ClientFrame::Connect {
                name: config.name.clone(),
                token: config.credentials.as_ref().map(|c| c.token().to_string()),
            };
            write_frame(&mut write_half, &connect).await.map_err(|e| e.to_string())?;
            write_frame(&mut write_half, &ClientFrame::Ping)
                .await
                .map_err(|e| e.to_string())?;

            match reader.read_frame::<ServerFrame>().await {
                Ok(Some(ServerFrame::Pong)) => Ok((server_id, max_payload)),
                Ok(Some(ServerFrame::Err { message })) => Err(format!("Server rejected connection: {}", message)),
                Ok(Some(other)) => Err(format!("Expected Pong, got {:?}", other)),
                Ok(None) => Err("Server closed connection".to_string()),
                Err(e) => Err(e.to_string()),
            }
        };
        let (server_id, max_payload) = tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| transport_err(format!("Timed out handshaking with {}", config.server)))?
            .map_err(transport_err)?;

        // Deliveries can carry payloads as large as the server accepts
        reader.set_max_frame_bytes(config.max_frame_bytes.max(frame_limit(max_payload)));

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(OUTBOUND_BUFFER);
        let shared = Arc::new(Shared {
            out: out_tx,
            handlers: Mutex::new(HashMap::new()),
            pongs: Mutex::new(VecDeque::new()),
            ping_order: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let writer_shared = shared.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    warn!(error = %e, "RemoteTransport writer stopped");
                    writer_shared.shut();
                    break;
                }
            }
        });
        let reader = tokio::spawn(read_loop(reader, shared.clone(), writer.abort_handle()));

        info!(server = %config.server, %server_id, max_payload, "Connected to broker");
        Ok(Self {
            shared,
            inbox_prefix: config.inbox_prefix,
            server_id,
            max_payload,
            reader,
            writer,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Largest payload the server accepts
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// True once the connection is gone
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Flush pending frames, then close the connection
    pub async fn close(&self) {
        debug!("RemoteTransport::close: called");
        if !self.is_closed() {
            let _ = self.flush().await;
        }
        self.shared.shut();
        self.writer.abort();
        self.reader.abort();
    }

    async fn send(&self, frame: ClientFrame) -> std::result::Result<(), String> {
        if self.is_closed() {
            return Err("connection closed".to_string());
        }
        self.shared
            .out
            .send(frame)
            .await
            .map_err(|_| "connection closed".to_string())
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Dispatch server frames until the connection ends
async fn read_loop(mut reader: FrameReader<OwnedReadHalf>, shared: Arc<Shared>, writer: AbortHandle) {
    loop {
        let frame = match reader.read_frame::<ServerFrame>().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Broker closed connection");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Dropping malformed frame from server");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Connection read failed");
                break;
            }
        };

        match frame {
            ServerFrame::Msg {
                sid,
                subject,
                reply,
                headers,
                payload,
            } => {
                let Some(handler) = shared.handler(&sid) else {
                    debug!(%sid, "Delivery for unknown sid");
                    continue;
                };
                let msg = Message {
                    subject,
                    reply,
                    headers,
                    payload,
                };
                tokio::spawn(async move { handler.handle(msg).await });
            }
            ServerFrame::Pong => {
                if let Some(waiter) = shared.next_pong_waiter() {
                    let _ = waiter.send(());
                }
            }
            ServerFrame::Err { message } => warn!(%message, "Server reported error"),
            ServerFrame::Info { server_id, .. } => debug!(%server_id, "Ignoring repeated Info"),
        }
    }

    // Later sends fail once the writer's receiver is gone
    writer.abort();
    shared.shut();
}

#[async_trait]
impl Transport for RemoteTransport {
    fn new_reply_address(&self) -> GatherResult<String> {
        if self.is_closed() {
            return Err(GatherError::AddressGeneration("not connected".to_string()));
        }
        Ok(generate_reply_address(&self.inbox_prefix))
    }

    async fn subscribe(&self, subject: &str, handler: Arc<dyn MessageHandler>) -> GatherResult<SubscriptionHandle> {
        let sid = Uuid::now_v7().to_string();
        debug!(%sid, %subject, "RemoteTransport::subscribe: called");

        self.shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sid.clone(), handler);

        let frame = ClientFrame::Sub {
            sid: sid.clone(),
            subject: subject.to_string(),
        };
        let registered = match self.send(frame).await {
            Ok(()) => self.flush().await.map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        if let Err(message) = registered {
            self.shared
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&sid);
            return Err(GatherError::Subscribe {
                subject: subject.to_string(),
                message,
            });
        }

        Ok(SubscriptionHandle::new(sid, subject))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatherResult<()> {
        debug!(sid = %handle.id(), subject = %handle.subject(), "RemoteTransport::unsubscribe: called");
        let removed = self
            .shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle.id())
            .is_some();
        if !removed {
            debug!("RemoteTransport::unsubscribe: already removed");
            return Ok(());
        }

        let frame = ClientFrame::Unsub {
            sid: handle.id().to_string(),
        };
        if let Err(e) = self.send(frame).await {
            // A closed connection holds no subscriptions on the server
            debug!(error = %e, "RemoteTransport::unsubscribe: connection gone");
        }
        Ok(())
    }

    async fn publish(&self, msg: Message) -> GatherResult<()> {
        debug!(subject = %msg.subject, reply = ?msg.reply, "RemoteTransport::publish: called");
        let subject = msg.subject.clone();
        if msg.payload.len() > self.max_payload {
            return Err(GatherError::Publish {
                subject,
                message: format!(
                    "payload of {} bytes exceeds server limit of {} bytes",
                    msg.payload.len(),
                    self.max_payload
                ),
            });
        }
        self.send(ClientFrame::publish(msg))
            .await
            .map_err(|message| GatherError::Publish { subject, message })
    }

    async fn flush(&self) -> GatherResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            // Waiters must queue in the order their Pings go out
            let _order = self.shared.ping_order.lock().await;
            self.shared
                .pongs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(tx);
            self.send(ClientFrame::Ping).await.map_err(GatherError::Transport)?;
        }
        rx.await
            .map_err(|_| GatherError::Transport("connection closed before flush completed".to_string()))
    }
}
