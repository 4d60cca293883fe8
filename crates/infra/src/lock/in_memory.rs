//! In-memory locker for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use super::{LockAttempt, LockError, LockToken, Locker, ReleaseOutcome, lock_key};

#[derive(Debug)]
struct Held {
    token: LockToken,
    expires_at: Instant,
}

/// Process-local locker with the same semantics as the Redis one.
#[derive(Debug, Default)]
pub struct InMemoryLocker {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        self.held
            .lock()
            .map(|h| h.get(&lock_key(key)).is_some_and(|l| l.expires_at > now))
            .unwrap_or(false)
    }
}

impl Locker for InMemoryLocker {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<LockAttempt, LockError> {
        if ttl.is_zero() {
            return Err(LockError::ZeroTtl);
        }
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        let now = Instant::now();
        let key = lock_key(key);

        if held.get(&key).is_some_and(|l| l.expires_at > now) {
            return Ok(LockAttempt::Contended);
        }

        let token = LockToken::generate();
        held.insert(
            key,
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(LockAttempt::Acquired(token))
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        let now = Instant::now();
        let full_key = lock_key(key);

        let owned = held
            .get(&full_key)
            .is_some_and(|l| l.expires_at > now && &l.token == token);
        if owned {
            held.remove(&full_key);
            return Ok(ReleaseOutcome::Released);
        }

        warn!(key, "lock release ignored: not the owner or already expired");
        Ok(ReleaseOutcome::NotOwner)
    }
}
