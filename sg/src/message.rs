//! Message types carried through the transport

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Header name to list of values
pub type Headers = BTreeMap<String, Vec<String>>;

/// Transport-level envelope for anything published through a broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,

    /// Return path, set on requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Headers,

    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with no reply address and no headers
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    /// Set the reply address
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Append a header value
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A request for one scatter-gather round
///
/// Immutable once constructed; the collector owns it for the duration of the round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    subject: String,
    reply_address: String,
    payload: Vec<u8>,
    headers: Headers,
}

impl Request {
    pub fn new(
        subject: impl Into<String>,
        reply_address: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        headers: Headers,
    ) -> Self {
        let subject = subject.into();
        let reply_address = reply_address.into();
        debug!(%subject, %reply_address, "Request::new: called");
        Self {
            subject,
            reply_address,
            payload: payload.into(),
            headers,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Build the envelope that goes on the wire
    pub fn to_message(&self) -> Message {
        Message {
            subject: self.subject.clone(),
            reply: Some(self.reply_address.clone()),
            headers: self.headers.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// One answer from a responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "source-subject")]
    pub source_subject: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    #[serde(rename = "received-at")]
    pub received_at: DateTime<Utc>,
}

impl Reply {
    /// Stamp a delivered message as a reply received now
    pub fn from_message(msg: Message) -> Self {
        Self {
            source_subject: msg.subject,
            headers: msg.headers,
            body: msg.payload,
            received_at: Utc::now(),
        }
    }

    /// Body as text, replacing invalid UTF-8
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let msg = Message::new("svc.echo", "ping")
            .with_reply("_INBOX.abc")
            .with_header("Trace", "1")
            .with_header("Trace", "2");

        assert_eq!(msg.subject, "svc.echo");
        assert_eq!(msg.reply.as_deref(), Some("_INBOX.abc"));
        assert_eq!(msg.headers["Trace"], vec!["1".to_string(), "2".to_string()]);
        assert_eq!(msg.payload_str(), "ping");
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let msg = Message::new("svc.echo", "ping");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("reply"));
        assert!(!json.contains("headers"));
    }

    #[test]
    fn test_request_to_message_carries_return_path() {
        let mut headers = Headers::new();
        headers.insert("Origin".to_string(), vec!["cli".to_string()]);
        let request = Request::new("svc.echo", "_INBOX.xyz", b"ping".to_vec(), headers);

        let msg = request.to_message();
        assert_eq!(msg.subject, "svc.echo");
        assert_eq!(msg.reply.as_deref(), Some("_INBOX.xyz"));
        assert_eq!(msg.headers["Origin"], vec!["cli".to_string()]);
        assert_eq!(msg.payload, b"ping");
    }

    #[test]
    fn test_reply_from_message() {
        let msg = Message::new("_INBOX.xyz", "pong").with_header("Responder", "echo-1");
        let reply = Reply::from_message(msg);

        assert_eq!(reply.source_subject, "_INBOX.xyz");
        assert_eq!(reply.body_text(), "pong");
        assert_eq!(reply.headers["Responder"], vec!["echo-1".to_string()]);
    }

    #[test]
    fn test_reply_body_text_lossy() {
        let reply = Reply::from_message(Message::new("s", vec![0xff, b'o', b'k']));
        assert!(reply.body_text().ends_with("ok"));
    }
}
