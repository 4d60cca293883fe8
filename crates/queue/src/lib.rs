//! Job queue abstraction: named durable channels with competing consumers.

pub mod in_memory;
pub mod queue;

pub use in_memory::InMemoryJobQueue;
pub use queue::{DEFAULT_POLL_TIMEOUT, JobQueue, QueueError};

/// Default channel carrying encoded upload jobs.
pub const UPLOADS_CHANNEL: &str = "postline:attachment_uploads";
