//! Aggregation session state machine

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Ceiling for deadlines that would overflow the clock
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Lifecycle of one scatter-gather round
///
/// `Listening` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Listening,
    /// Count reached
    Satisfied,
    /// Deadline passed, queue closed, or shutdown requested
    Expired,
    /// Publish failed
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Listening)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening => write!(f, "listening"),
            Self::Satisfied => write!(f, "satisfied"),
            Self::Expired => write!(f, "expired"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One round's counters and deadline
///
/// Owned by the aggregation loop; delivery callbacks never touch it.
#[derive(Debug)]
pub struct AggregationSession {
    reply_address: String,
    started: Instant,
    deadline: Instant,
    max_replies: usize,
    received: usize,
    state: SessionState,
}

impl AggregationSession {
    /// Start a session whose window opened at `started`
    pub fn new(reply_address: impl Into<String>, max_replies: usize, window: Duration, started: Instant) -> Self {
        let reply_address = reply_address.into();
        let deadline = started
            .checked_add(window)
            .unwrap_or_else(|| started + FAR_FUTURE);
        debug!(%reply_address, max_replies, ?window, "AggregationSession::new: called");
        Self {
            reply_address,
            started,
            deadline,
            max_replies,
            received: 0,
            state: SessionState::Listening,
        }
    }

    /// Time left before the deadline, or None once it has passed
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let remaining = self.deadline.saturating_duration_since(now);
        if remaining.is_zero() { None } else { Some(remaining) }
    }

    /// Count one reply; ignored unless the session is still listening
    pub fn record_reply(&mut self) -> SessionState {
        if self.state != SessionState::Listening {
            debug!(state = %self.state, "AggregationSession::record_reply: inactive, ignoring");
            return self.state;
        }

        self.received += 1;
        if self.received >= self.max_replies {
            self.transition(SessionState::Satisfied);
        }
        self.state
    }

    pub fn expire(&mut self) {
        self.transition(SessionState::Expired);
    }

    pub fn fail(&mut self) {
        self.transition(SessionState::Failed);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            reply_address = %self.reply_address,
            received = self.received,
            state = %next,
            "AggregationSession: terminal"
        );
        self.state = next;
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Listening
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn max_replies(&self) -> usize {
        self.max_replies
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
