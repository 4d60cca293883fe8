//! Configuration loading and representation.
//!
//! Everything comes from environment variables. [`AppConfig::from_lookup`] takes any
//! key lookup so tests never touch the process environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BIND_ADDR` | `0.0.0.0:8080` |
//! | `BACKEND` | `memory` (`redis` needs `REDIS_URL`) |
//! | `REDIS_URL` | unset |
//! | `DATABASE_URL` | unset (every well-formed post id is accepted) |
//! | `UPLOAD_CHANNEL` | `postline:attachment_uploads` |
//! | `DEAD_LETTER_CHANNEL` | unset (malformed payloads are dropped) |
//! | `STATUS_TTL_SECS` | `3600` |
//! | `SSE_POLL_INTERVAL_MS` | `1000` |
//! | `LOCK_TTL_SECS` | `300` |
//! | `BREAKER_FAILURE_THRESHOLD` | `5` |
//! | `BREAKER_WINDOW_SECS` | `60` |
//! | `BREAKER_COOLDOWN_SECS` | `30` |
//! | `BREAKER_HALF_OPEN_CALLS` | `1` |
//! | `UPLOAD_BASE_URL` | unset (files go to `UPLOAD_DIR`) |
//! | `UPLOAD_DIR` | `./uploads` |
//! | `UPLOAD_TIMEOUT_SECS` | `30` |
//! | `MAX_UPLOAD_BYTES` | `10485760` |
//! | `EMBEDDED_WORKER` | `true` |
//! | `STREAM_MAX_LEN` | `10000` (approximate Redis stream cap) |
//! | `LOG_FORMAT` | `json` (`pretty` for a terminal) |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use postline_observability::LogFormat;
use postline_queue::UPLOADS_CHANNEL;

use crate::breaker::BreakerSettings;

pub const DEFAULT_STREAM_MAX_LEN: usize = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Queue, cache and locks live in this process.
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Http { base_url: String, timeout: Duration },
    LocalDir { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub backend: Backend,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub upload_channel: String,
    pub dead_letter_channel: Option<String>,
    pub status_ttl: Duration,
    pub sse_poll_interval: Duration,
    pub lock_ttl: Duration,
    pub breaker: BreakerSettings,
    pub storage: StorageConfig,
    pub max_upload_bytes: usize,
    pub embedded_worker: bool,
    pub stream_max_len: usize,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get("BACKEND").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("memory") => Backend::Memory,
            Some("redis") => Backend::Redis,
            Some(other) => return Err(invalid("BACKEND", other, "expected memory or redis")),
        };

        let redis_url = get("REDIS_URL");
        if backend == Backend::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL".to_string()));
        }

        let storage = match get("UPLOAD_BASE_URL") {
            Some(base_url) => StorageConfig::Http {
                base_url,
                timeout: Duration::from_secs(parse_or(&get, "UPLOAD_TIMEOUT_SECS", 30u64)?),
            },
            None => StorageConfig::LocalDir {
                root: PathBuf::from(get("UPLOAD_DIR").unwrap_or_else(|| "./uploads".to_string())),
            },
        };

        let breaker = BreakerSettings {
            name: "object-storage".to_string(),
            failure_threshold: parse_or(&get, "BREAKER_FAILURE_THRESHOLD", 5u32)?,
            window: Duration::from_secs(parse_or(&get, "BREAKER_WINDOW_SECS", 60u64)?),
            cooldown: Duration::from_secs(parse_or(&get, "BREAKER_COOLDOWN_SECS", 30u64)?),
            half_open_max_calls: parse_or(&get, "BREAKER_HALF_OPEN_CALLS", 1u32)?,
        };
        breaker
            .validate()
            .map_err(|reason| invalid("BREAKER_*", "", &reason))?;

        let config = Self {
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            backend,
            redis_url,
            database_url: get("DATABASE_URL"),
            upload_channel: get("UPLOAD_CHANNEL").unwrap_or_else(|| UPLOADS_CHANNEL.to_string()),
            dead_letter_channel: get("DEAD_LETTER_CHANNEL"),
            status_ttl: Duration::from_secs(parse_or(&get, "STATUS_TTL_SECS", 3600u64)?),
            sse_poll_interval: Duration::from_millis(parse_or(&get, "SSE_POLL_INTERVAL_MS", 1000u64)?),
            lock_ttl: Duration::from_secs(parse_or(&get, "LOCK_TTL_SECS", 300u64)?),
            breaker,
            storage,
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", 10 * 1024 * 1024usize)?,
            embedded_worker: parse_bool_or(&get, "EMBEDDED_WORKER", true)?,
            stream_max_len: parse_or(&get, "STREAM_MAX_LEN", DEFAULT_STREAM_MAX_LEN)?,
            log_format: parse_or(&get, "LOG_FORMAT", LogFormat::default())?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == Backend::Memory && !self.embedded_worker {
            return Err(invalid(
                "EMBEDDED_WORKER",
                "false",
                "the memory backend needs the worker in-process",
            ));
        }
        if self.status_ttl.is_zero() {
            return Err(invalid("STATUS_TTL_SECS", "0", "must be positive"));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid("LOCK_TTL_SECS", "0", "must be positive"));
        }
        if self.sse_poll_interval.is_zero() {
            return Err(invalid("SSE_POLL_INTERVAL_MS", "0", "must be positive"));
        }
        if self.stream_max_len == 0 {
            return Err(invalid("STREAM_MAX_LEN", "0", "must be positive"));
        }
        if self.dead_letter_channel.as_deref() == Some(self.upload_channel.as_str()) {
            return Err(invalid(
                "DEAD_LETTER_CHANNEL",
                &self.upload_channel,
                "must differ from UPLOAD_CHANNEL",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(invalid(key, &v, "expected a boolean")),
    }
}
