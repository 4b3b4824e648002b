//! Reply sinks
//!
//! The collector hands every counted reply to a sink and keeps nothing itself.

use std::sync::Mutex;

use colored::*;
use tokio::time::Instant;

use crate::message::Reply;

/// Destination for collected replies
pub trait ReplySink: Send + Sync {
    fn accept(&self, reply: Reply);
}

impl<F> ReplySink for F
where
    F: Fn(Reply) + Send + Sync,
{
    fn accept(&self, reply: Reply) {
        self(reply)
    }
}

/// Discards replies
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReplySink for NullSink {
    fn accept(&self, _reply: Reply) {}
}

/// Keeps replies in arrival order
#[derive(Debug, Default)]
pub struct CollectingSink {
    replies: Mutex<Vec<Reply>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything collected so far
    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.replies.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReplySink for CollectingSink {
    fn accept(&self, reply: Reply) {
        self.replies.lock().unwrap_or_else(|e| e.into_inner()).push(reply);
    }
}

/// Prints each reply as it arrives: status and headers to stderr, body to stdout
#[derive(Debug)]
pub struct PrintSink {
    started: Instant,
}

impl PrintSink {
    /// `started` is when the request went out, for round-trip times
    pub fn new(started: Instant) -> Self {
        Self { started }
    }
}

impl ReplySink for PrintSink {
    fn accept(&self, reply: Reply) {
        eprintln!(
            "{} on {} rtt {:?}",
            "Received".green(),
            reply.source_subject.cyan(),
            self.started.elapsed()
        );
        for line in header_lines(&reply) {
            eprintln!("{}", line);
        }
        if !reply.headers.is_empty() {
            eprintln!();
        }
        print!("{}", render_body(&reply));
    }
}

/// `name: value`, one line per header value
pub fn header_lines(reply: &Reply) -> Vec<String> {
    reply
        .headers
        .iter()
        .flat_map(|(name, values)| values.iter().map(move |value| format!("{}: {}", name, value)))
        .collect()
}

/// Body followed by a blank separator line
pub fn render_body(reply: &Reply) -> String {
    let body = reply.body_text();
    if body.ends_with('\n') {
        format!("{}\n", body)
    } else {
        format!("{}\n\n", body)
    }
}
