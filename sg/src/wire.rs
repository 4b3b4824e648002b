//! Broker wire protocol
//!
//! Newline-delimited JSON. Each frame is a single line of JSON followed by `\n`.
//! Payloads travel as base64 strings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::message::{Headers, Message};

/// Default largest payload, in bytes
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Room left in a frame for everything but the payload
pub const FRAME_HEADROOM: usize = 64 * 1024;

/// Default largest frame, in bytes
pub const DEFAULT_MAX_FRAME_BYTES: usize = frame_limit(DEFAULT_MAX_PAYLOAD_BYTES);

/// Frame limit that fits a payload of `max_payload_bytes` once base64 encoded
pub const fn frame_limit(max_payload_bytes: usize) -> usize {
    max_payload_bytes.div_ceil(3) * 4 + FRAME_HEADROOM
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

/// Frames from clients to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Must be the first frame on a connection
    Connect {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    Sub { sid: String, subject: String },

    Unsub { sid: String },

    Pub {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "Headers::is_empty")]
        headers: Headers,
        #[serde(default, with = "base64_bytes")]
        payload: Vec<u8>,
    },

    /// Answered with Pong once every earlier frame was processed
    Ping,
}

impl ClientFrame {
    /// Publish frame for a message
    pub fn publish(msg: Message) -> Self {
        ClientFrame::Pub {
            subject: msg.subject,
            reply: msg.reply,
            headers: msg.headers,
            payload: msg.payload,
        }
    }
}

/// Frames from the server to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Sent once on accept
    Info {
        server_id: String,
        version: String,
        /// Largest payload the server accepts in Pub
        #[serde(default = "default_max_payload")]
        max_payload: usize,
    },

    /// Delivery for subscription `sid`
    Msg {
        sid: String,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "Headers::is_empty")]
        headers: Headers,
        #[serde(default, with = "base64_bytes")]
        payload: Vec<u8>,
    },

    Pong,

    Err { message: String },
}

impl ServerFrame {
    /// Delivery frame for a message on subscription `sid`
    pub fn deliver(sid: impl Into<String>, msg: Message) -> Self {
        ServerFrame::Msg {
            sid: sid.into(),
            subject: msg.subject,
            reply: msg.reply,
            headers: msg.headers,
            payload: msg.payload,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        ServerFrame::Err {
            message: message.into(),
        }
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Errors reading or writing frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame exceeds limit of {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl FrameError {
    /// Check if the connection can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed(_))
    }
}

/// Reads frames off one half of a connection
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes: max_frame_bytes.max(1),
            line: String::new(),
        }
    }

    /// Raise or lower the limit for frames read from now on
    pub fn set_max_frame_bytes(&mut self, max_frame_bytes: usize) {
        self.max_frame_bytes = max_frame_bytes.max(1);
    }

    /// Next frame, or None at end of stream
    ///
    /// Blank lines are skipped. A frame over the limit is fatal since the rest of the
    /// line can no longer be told apart from the next frame.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        loop {
            self.line.clear();
            let limit = self.max_frame_bytes as u64 + 1;
            let bytes_read = (&mut self.reader).take(limit).read_line(&mut self.line).await?;

            if bytes_read == 0 {
                return Ok(None);
            }
            if bytes_read > self.max_frame_bytes {
                return Err(FrameError::TooLarge {
                    limit: self.max_frame_bytes,
                });
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

/// Serialize and send one frame
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + std::fmt::Debug,
{
    let mut json = serde_json::to_vec(frame)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;
    debug!(bytes = json.len(), "write_frame: sent");
    Ok(())
}
