//! Infrastructure job queue implementations.
//!
//! The queue abstraction lives in `postline-queue` as pure mechanics.
//! This module provides infrastructure-backed implementations (Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;
