//! Infrastructure layer: Redis, Postgres, object storage, config and the upload worker.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod job_queue;
pub mod lock;
pub mod notifier;
pub mod posts;
pub mod status_store;
pub mod uploader;
pub mod worker;

mod integration_tests;

pub use breaker::{BreakerError, BreakerSettings, CircuitBreaker, CircuitState};
pub use config::{AppConfig, Backend, ConfigError, StorageConfig};
pub use status_store::UploadStatusStore;
pub use worker::{JobOutcome, UploadWorker, WorkerHandle, WorkerSettings};
