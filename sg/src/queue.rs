//! Bounded signal queue
//!
//! Fixed-capacity fan-in channel between subscription delivery callbacks (many
//! producers, possibly running concurrently) and the aggregation loop (one consumer).
//! A full queue makes producers wait instead of dropping signals, so a burst of
//! replies throttles the delivery path rather than losing counts.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Default number of buffered signals
pub const DEFAULT_SIGNAL_CAPACITY: usize = 128;

/// Outcome of waiting on the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop<T> {
    Signal(T),
    Timeout,
    Closed,
}

/// Errors from pushing a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("Signal queue is full")]
    Full,

    #[error("Signal queue is closed")]
    Closed,
}

/// Create a bounded signal queue with the given capacity (at least 1)
pub fn signal_queue<T>(capacity: usize) -> (SignalProducer<T>, SignalConsumer<T>) {
    let capacity = capacity.max(1);
    debug!(capacity, "signal_queue: called");
    let (tx, rx) = mpsc::channel(capacity);
    (SignalProducer { tx }, SignalConsumer { rx, capacity })
}

/// Producer half, cloned into every delivery callback
#[derive(Debug)]
pub struct SignalProducer<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for SignalProducer<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> SignalProducer<T> {
    /// Push a signal, waiting for space while the queue is full
    pub async fn push(&self, signal: T) -> Result<(), PushError> {
        self.tx.send(signal).await.map_err(|_| PushError::Closed)
    }

    /// Push a signal without waiting
    pub fn try_push(&self, signal: T) -> Result<(), PushError> {
        match self.tx.try_send(signal) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PushError::Full),
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// True once the consumer closed or dropped the queue
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the aggregation loop
#[derive(Debug)]
pub struct SignalConsumer<T> {
    rx: mpsc::Receiver<T>,
    capacity: usize,
}

impl<T> SignalConsumer<T> {
    /// Wait up to `timeout` for the next signal
    ///
    /// A signal already buffered is returned even when `timeout` is zero.
    pub async fn pop(&mut self, timeout: Duration) -> Pop<T> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(signal)) => Pop::Signal(signal),
            Ok(None) => Pop::Closed,
            Err(_) => Pop::Timeout,
        }
    }

    /// Refuse further pushes; signals already buffered can still be popped
    pub fn close(&mut self) {
        debug!(buffered = self.rx.len(), "SignalConsumer::close: called");
        self.rx.close();
    }

    /// Number of buffered signals
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
