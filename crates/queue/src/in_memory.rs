//! In-memory job queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::queue::{JobQueue, QueueError};

#[derive(Debug, Default)]
struct Channels {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    closed: bool,
}

/// Process-local queue with competing consumers.
///
/// - No IO
/// - FIFO per channel
/// - Each message goes to exactly one `receive` call
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<Channels>,
    available: Condvar,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of undelivered messages on `channel`.
    pub fn depth(&self, channel: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.queues.get(channel).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Close every channel. Pending and future `receive` calls fail with
    /// [`QueueError::Closed`].
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.available.notify_all();
    }
}

impl JobQueue for InMemoryJobQueue {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        if state.closed {
            return Err(QueueError::Closed(channel.to_owned()));
        }
        state
            .queues
            .entry(channel.to_owned())
            .or_default()
            .push_back(payload.to_vec());
        drop(state);

        self.available.notify_all();
        Ok(())
    }

    fn receive(&self, channel: &str, timeout: Duration) -> Result<Option<Vec<u8>>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;

        loop {
            if state.closed {
                return Err(QueueError::Closed(channel.to_owned()));
            }
            if let Some(payload) = state.queues.get_mut(channel).and_then(VecDeque::pop_front) {
                return Ok(Some(payload));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| QueueError::Poisoned)?;
            state = next;
        }
    }
}
