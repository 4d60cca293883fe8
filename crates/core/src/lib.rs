//! `postline-core`: upload pipeline building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): identifiers,
//! the queued job message and the upload status state machine.

pub mod error;
pub mod id;
pub mod job;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::{PostId, UploadId};
pub use job::UploadJob;
pub use status::UploadStatus;
