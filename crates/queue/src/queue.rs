//! Job queue abstraction (mechanics only).
//!
//! A `JobQueue` moves opaque byte payloads from producers to workers over **named
//! durable channels**. Every message is delivered to exactly one consumer of a channel
//! (competing consumers, not broadcast).
//!
//! ## Delivery guarantees
//!
//! - **Auto-ack**: a message counts as acknowledged the moment it is handed to a consumer.
//!   A handler that fails does not cause redelivery, so delivery is at-most-once from the
//!   handler's point of view.
//! - **No cross-job ordering**: consumers must not rely on the relative order of jobs.
//! - **No retries**: neither `publish` nor `consume` retries individual messages. Callers
//!   see transient failures and decide.
//!
//! ## Usage pattern
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();
//! queue.consume("uploads", &shutdown_rx, &mut |payload| handle(payload))?;
//! ```

use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use thiserror::Error;

/// How long a single `receive` inside [`JobQueue::consume`] waits before re-checking the
/// shutdown signal.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),

    #[error("queue command failed: {0}")]
    Command(String),

    /// The channel can never deliver again (broker shut down, queue dropped).
    #[error("queue channel closed: {0}")]
    Closed(String),

    #[error("queue state poisoned")]
    Poisoned,
}

impl QueueError {
    /// Transient errors are worth another receive attempt on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Command(_))
    }
}

/// Transport-agnostic job queue.
///
/// The trait is object safe so that services can hold an `Arc<dyn JobQueue>` and swap the
/// Redis-backed queue for the in-memory one in tests.
pub trait JobQueue: Send + Sync {
    /// Enqueue `payload` on `channel`, creating the channel if absent.
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Wait up to `timeout` for one message on `channel`.
    ///
    /// `Ok(None)` means nothing arrived in time. A returned payload is already
    /// acknowledged.
    fn receive(&self, channel: &str, timeout: Duration) -> Result<Option<Vec<u8>>, QueueError>;

    /// Block, invoking `handler` for every message delivered on `channel`.
    ///
    /// Returns `Ok(())` once `shutdown` fires (or its sender is dropped) and
    /// `Err(QueueError::Closed)` when the channel closes for good. Transient receive errors
    /// are logged and the loop resumes after one poll tick.
    fn consume(
        &self,
        channel: &str,
        shutdown: &Receiver<()>,
        handler: &mut dyn FnMut(Vec<u8>),
    ) -> Result<(), QueueError> {
        tracing::info!(channel, "consumer started");
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    tracing::info!(channel, "consumer stopping");
                    return Ok(());
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.receive(channel, DEFAULT_POLL_TIMEOUT) {
                Ok(Some(payload)) => handler(payload),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(channel, error = %e, "receive failed, retrying next tick");
                    // Back off for a tick unless shutdown arrives first.
                    match shutdown.recv_timeout(DEFAULT_POLL_TIMEOUT) {
                        Ok(()) => return Ok(()),
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(channel, error = %e, "consumer terminated");
                    return Err(e);
                }
            }
        }
    }
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), QueueError> {
        (**self).publish(channel, payload)
    }

    fn receive(&self, channel: &str, timeout: Duration) -> Result<Option<Vec<u8>>, QueueError> {
        (**self).receive(channel, timeout)
    }

    fn consume(
        &self,
        channel: &str,
        shutdown: &Receiver<()>,
        handler: &mut dyn FnMut(Vec<u8>),
    ) -> Result<(), QueueError> {
        (**self).consume(channel, shutdown, handler)
    }
}
