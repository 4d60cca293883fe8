//! Redis Streams-backed job queue (durable channels, auto-ack delivery).
//!
//! - **Channel**: one stream key per channel name
//! - **Consumer group**: all workers of a channel share one group, so each entry goes to
//!   exactly one worker
//! - **Auto-ack**: entries are read with `XREADGROUP … NOACK`; delivery is the
//!   acknowledgement and nothing is ever redelivered
//! - **Bounded**: `XADD MAXLEN ~` keeps delivered entries from growing the stream forever

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use postline_queue::{JobQueue, QueueError};

/// Default consumer group shared by upload workers.
const DEFAULT_GROUP: &str = "postline.upload-workers";

/// Approximate number of entries retained per stream.
const DEFAULT_MAX_LEN: usize = 10_000;

/// Stream field holding the opaque payload.
const PAYLOAD_FIELD: &str = "payload";

/// Connections kept open between commands.
const MAX_IDLE_CONNECTIONS: usize = 4;

/// Reuses open connections across commands.
///
/// A connection goes back to the pool only when its command did not fail with
/// [`QueueError::Connection`]; a broken one is dropped and the next command reconnects.
struct IdlePool<C> {
    idle: Mutex<Vec<C>>,
    max_idle: usize,
}

impl<C> IdlePool<C> {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    fn run<T, O, F>(&self, open: O, f: F) -> Result<T, QueueError>
    where
        O: FnOnce() -> Result<C, QueueError>,
        F: FnOnce(&mut C) -> Result<T, QueueError>,
    {
        let pooled = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let mut conn = match pooled {
            Some(conn) => conn,
            None => open()?,
        };

        let result = f(&mut conn);
        match &result {
            Err(QueueError::Connection(_)) => {}
            _ => {
                if let Ok(mut idle) = self.idle.lock() {
                    if idle.len() < self.max_idle {
                        idle.push(conn);
                    }
                }
            }
        }
        result
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    group_name: String,
    consumer_name: String,
    max_len: usize,
    // Streams whose consumer group has already been created by this instance.
    known_groups: Arc<Mutex<Vec<String>>>,
    connections: Arc<IdlePool<redis::Connection>>,
}

impl std::fmt::Debug for RedisStreamsJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsJobQueue")
            .field("group_name", &self.group_name)
            .field("consumer_name", &self.consumer_name)
            .field("max_len", &self.max_len)
            .field("idle_connections", &self.connections.idle_count())
            .finish_non_exhaustive()
    }
}

impl RedisStreamsJobQueue {
    /// Create a new Redis Streams job queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `group_name` - Consumer group shared by competing workers (default:
    ///   "postline.upload-workers")
    pub fn new(redis_url: impl AsRef<str>, group_name: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            group_name: group_name.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            max_len: DEFAULT_MAX_LEN,
            known_groups: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(IdlePool::new(MAX_IDLE_CONNECTIONS)),
        })
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Ensure the consumer group for `channel` exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream if absent. Starting at `0` hands entries published
    /// before the first worker came up to that worker.
    fn ensure_consumer_group(
        &self,
        conn: &mut redis::Connection,
        channel: &str,
    ) -> Result<(), QueueError> {
        if self
            .known_groups
            .lock()
            .map(|g| g.iter().any(|c| c == channel))
            .unwrap_or(false)
        {
            return Ok(());
        }

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(channel)
            .arg(&self.group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);

        match created {
            Ok(_) => debug!(channel, group = %self.group_name, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(command_error("XGROUP CREATE", e)),
        }

        if let Ok(mut groups) = self.known_groups.lock() {
            groups.push(channel.to_string());
        }
        Ok(())
    }

    fn forget_group(&self, channel: &str) {
        if let Ok(mut groups) = self.known_groups.lock() {
            groups.retain(|c| c != channel);
        }
    }

    #[instrument(skip(self, payload), fields(channel, bytes = payload.len()), err)]
    fn publish_sync(&self, channel: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.connections
            .run(|| self.connection(), |conn| self.xadd(conn, channel, payload))
    }

    fn xadd(&self, conn: &mut redis::Connection, channel: &str, payload: &[u8]) -> Result<(), QueueError> {
        let _: String = redis::cmd("XADD")
            .arg(channel)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query(conn)
            .map_err(|e| command_error("XADD", e))?;

        Ok(())
    }

    fn read_group_sync(&self, channel: &str, block: Duration) -> Result<Option<Vec<u8>>, QueueError> {
        self.connections
            .run(|| self.connection(), |conn| self.xreadgroup(conn, channel, block))
    }

    fn xreadgroup(
        &self,
        conn: &mut redis::Connection,
        channel: &str,
        block: Duration,
    ) -> Result<Option<Vec<u8>>, QueueError> {
        self.ensure_consumer_group(conn, channel)?;

        // BLOCK 0 means "forever" to Redis; never pass it.
        let block_ms = block.as_millis().clamp(1, u128::from(u32::MAX)) as u64;

        let reply: redis::RedisResult<redis::Value> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group_name)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("NOACK")
            .arg("STREAMS")
            .arg(channel)
            .arg(">")
            .query(conn);

        match reply {
            Ok(value) => Ok(first_payload(value)?),
            Err(e) if e.code() == Some("NOGROUP") => {
                // Stream or group vanished (e.g. Redis restarted without persistence).
                warn!(channel, "consumer group missing, recreating");
                self.forget_group(channel);
                self.ensure_consumer_group(conn, channel)?;
                Ok(None)
            }
            Err(e) => Err(command_error("XREADGROUP", e)),
        }
    }
}

/// Broken connections map to [`QueueError::Connection`] so the pool discards them.
fn command_error(command: &str, e: redis::RedisError) -> QueueError {
    if e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal() {
        QueueError::Connection(format!("{command} failed: {e}"))
    } else {
        QueueError::Command(format!("{command} failed: {e}"))
    }
}

impl JobQueue for RedisStreamsJobQueue {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.publish_sync(channel, payload)
    }

    fn receive(&self, channel: &str, timeout: Duration) -> Result<Option<Vec<u8>>, QueueError> {
        self.read_group_sync(channel, timeout)
    }
}

/// Extract the payload of the first entry in an `XREADGROUP` reply.
///
/// Reply format: `[[stream, [[id, [field, value, ...]], ...]], ...]`, or nil on timeout.
fn first_payload(reply: redis::Value) -> Result<Option<Vec<u8>>, QueueError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(None),
        redis::Value::Bulk(streams) => streams,
        other => {
            return Err(QueueError::Command(format!(
                "unexpected XREADGROUP reply: {other:?}"
            )));
        }
    };

    for stream in streams {
        let redis::Value::Bulk(mut parts) = stream else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        let redis::Value::Bulk(entries) = parts.swap_remove(1) else {
            continue;
        };

        for entry in entries {
            let redis::Value::Bulk(entry) = entry else {
                continue;
            };
            // Entries trimmed between delivery and read come back as [id, nil].
            let Some(redis::Value::Bulk(fields)) = entry.into_iter().nth(1) else {
                continue;
            };
            let mut iter = fields.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                if let (redis::Value::Data(key), redis::Value::Data(value)) = (key, value) {
                    if key == PAYLOAD_FIELD.as_bytes() {
                        return Ok(Some(value));
                    }
                }
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn data(s: &[u8]) -> Value {
        Value::Data(s.to_vec())
    }

    #[test]
    fn nil_reply_means_no_message() {
        assert_eq!(first_payload(Value::Nil).unwrap(), None);
    }

    #[test]
    fn extracts_payload_field() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data(b"postline:attachment_uploads"),
            Value::Bulk(vec![Value::Bulk(vec![
                data(b"1700000000000-0"),
                Value::Bulk(vec![data(b"payload"), data(b"{\"upload_id\":\"u1\"}")]),
            ])]),
        ])]);

        assert_eq!(
            first_payload(reply).unwrap(),
            Some(b"{\"upload_id\":\"u1\"}".to_vec())
        );
    }

    #[test]
    fn skips_trimmed_entries() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data(b"jobs"),
            Value::Bulk(vec![
                Value::Bulk(vec![data(b"1-0"), Value::Nil]),
                Value::Bulk(vec![
                    data(b"2-0"),
                    Value::Bulk(vec![data(b"other"), data(b"x"), data(b"payload"), data(b"y")]),
                ]),
            ]),
        ])]);

        assert_eq!(first_payload(reply).unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn pool_reuses_a_healthy_connection() {
        let pool = IdlePool::new(MAX_IDLE_CONNECTIONS);
        let opened = std::cell::Cell::new(0u32);
        let open = || {
            opened.set(opened.get() + 1);
            Ok(opened.get())
        };

        for _ in 0..5 {
            let conn = pool.run(open, |conn| Ok(*conn)).unwrap();
            assert_eq!(conn, 1);
        }
        assert_eq!(opened.get(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn pool_drops_a_broken_connection_and_reconnects() {
        let pool = IdlePool::new(MAX_IDLE_CONNECTIONS);
        let opened = std::cell::Cell::new(0u32);
        let open = || {
            opened.set(opened.get() + 1);
            Ok(opened.get())
        };

        let broken: Result<(), QueueError> =
            pool.run(open, |_| Err(QueueError::Connection("reset by peer".to_string())));
        assert!(broken.is_err());
        assert_eq!(pool.idle_count(), 0);

        // Command errors leave the connection usable.
        let rejected: Result<(), QueueError> =
            pool.run(open, |_| Err(QueueError::Command("WRONGTYPE".to_string())));
        assert!(rejected.is_err());
        assert_eq!(pool.run(open, |conn| Ok(*conn)).unwrap(), 2);
        assert_eq!(opened.get(), 2);
    }

    #[test]
    fn pool_open_failure_is_returned() {
        let pool: IdlePool<u32> = IdlePool::new(1);
        let result = pool.run(
            || Err(QueueError::Connection("refused".to_string())),
            |conn| Ok(*conn),
        );
        assert_eq!(result, Err(QueueError::Connection("refused".to_string())));
    }

    #[test]
    fn rejects_unexpected_reply_shapes() {
        assert!(first_payload(Value::Int(3)).is_err());
    }
}
