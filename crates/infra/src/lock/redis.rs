//! Redis-backed locker.
//!
//! Acquire is `SET lock:<key> <token> NX PX <ttl>`. Release runs a Lua script so that the
//! ownership check and the delete happen as one server-side step.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::{LockAttempt, LockError, LockToken, Locker, ReleaseOutcome, lock_key};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLocker {
    client: Arc<redis::Client>,
    release_script: Arc<redis::Script>,
}

impl RedisLocker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self::from_client(Arc::new(client)))
    }

    pub fn from_client(client: Arc<redis::Client>) -> Self {
        Self {
            client,
            release_script: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
        }
    }

    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Connection(e.to_string()))
    }
}

fn command_error(op: &str, e: redis::RedisError) -> LockError {
    if e.is_connection_dropped() || e.is_io_error() {
        LockError::Connection(e.to_string())
    } else {
        LockError::Command(format!("{op} failed: {e}"))
    }
}

impl Locker for RedisLocker {
    #[instrument(skip(self), err)]
    fn acquire(&self, key: &str, ttl: Duration) -> Result<LockAttempt, LockError> {
        if ttl.is_zero() {
            return Err(LockError::ZeroTtl);
        }
        let mut conn = self.connection()?;
        let token = LockToken::generate();

        // Nil reply means the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(key))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query(&mut conn)
            .map_err(|e| command_error("SET NX", e))?;

        match reply {
            Some(_) => {
                debug!(key, "lock acquired");
                Ok(LockAttempt::Acquired(token))
            }
            None => Ok(LockAttempt::Contended),
        }
    }

    #[instrument(skip(self, token), err)]
    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        let mut conn = self.connection()?;

        let deleted: i64 = self
            .release_script
            .key(lock_key(key))
            .arg(token.as_str())
            .invoke(&mut conn)
            .map_err(|e| command_error("release script", e))?;

        if deleted == 1 {
            Ok(ReleaseOutcome::Released)
        } else {
            warn!(key, "lock release ignored: not the owner or already expired");
            Ok(ReleaseOutcome::NotOwner)
        }
    }
}
