//! Distributed mutual exclusion with owner tokens.
//!
//! A lock is `(key, token, ttl)`. Every acquire attempt draws a fresh random token, and
//! only the holder of that exact token can release the lock. A lock whose TTL elapsed is
//! indistinguishable from one that was never taken, so a stale token's release is a
//! harmless no-op.
//!
//! Contention is an ordinary outcome ([`LockAttempt::Contended`]), not an error.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLocker;
#[cfg(feature = "redis")]
pub use self::redis::RedisLocker;

/// Namespace for lock keys; disjoint from the status namespace.
pub const LOCK_KEY_PREFIX: &str = "lock:";

pub fn lock_key(key: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{key}")
}

/// Proof of ownership handed out by a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired(LockToken),
    Contended,
}

impl LockAttempt {
    pub fn token(&self) -> Option<&LockToken> {
        match self {
            LockAttempt::Acquired(token) => Some(token),
            LockAttempt::Contended => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The key is absent, expired, or held under another token. Nothing changed.
    NotOwner,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock store connection error: {0}")]
    Connection(String),

    #[error("lock store command error: {0}")]
    Command(String),

    #[error("lock ttl must be positive")]
    ZeroTtl,

    #[error("lock state poisoned")]
    Poisoned,
}

pub trait Locker: Send + Sync {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<LockAttempt, LockError>;

    /// Atomic compare-and-delete: removes the lock only while `token` still owns it.
    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, LockError>;
}

impl<L> Locker for Arc<L>
where
    L: Locker + ?Sized,
{
    fn acquire(&self, key: &str, ttl: Duration) -> Result<LockAttempt, LockError> {
        (**self).acquire(key, ttl)
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        (**self).release(key, token)
    }
}
