//! Redis-backed cache.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::{Cache, CacheError};

#[derive(Debug, Clone)]
pub struct RedisCache {
    client: Arc<redis::Client>,
}

impl RedisCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn from_client(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    fn connection(&self) -> Result<redis::Connection, CacheError> {
        self.client
            .get_connection()
            .map_err(|e| CacheError::Connection(e.to_string()))
    }
}

fn command_error(op: &str, e: redis::RedisError) -> CacheError {
    if e.is_connection_dropped() || e.is_io_error() {
        CacheError::Connection(e.to_string())
    } else {
        CacheError::Command(format!("{op} failed: {e}"))
    }
}

impl Cache for RedisCache {
    #[instrument(skip(self), err)]
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("GET", e))
    }

    #[instrument(skip(self, value), err)]
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query::<()>(&mut conn)
            .map_err(|e| command_error("SET", e))
    }

    #[instrument(skip(self), err)]
    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("DEL", e))?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_is_a_connection_error() {
        assert!(matches!(
            RedisCache::new("not a url"),
            Err(CacheError::Connection(_))
        ));
    }
}
