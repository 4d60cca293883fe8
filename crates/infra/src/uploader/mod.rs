//! Object storage uploaders.
//!
//! The pipeline treats storage as opaque: an uploader takes a job and returns the
//! location the bytes landed at.

use std::sync::Arc;

use thiserror::Error;

use postline_core::UploadJob;

pub mod http;
pub mod local;

pub use http::HttpObjectUploader;
pub use local::LocalDirUploader;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("storage transport error: {0}")]
    Transport(String),

    #[error("storage rejected upload with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("storage io error: {0}")]
    Io(String),

    #[error("invalid storage configuration: {0}")]
    Config(String),
}

pub trait Uploader: Send + Sync {
    /// Store the job's bytes. The returned bytes are the object location.
    fn upload(&self, job: &UploadJob) -> Result<Vec<u8>, UploadError>;
}

impl<U> Uploader for Arc<U>
where
    U: Uploader + ?Sized,
{
    fn upload(&self, job: &UploadJob) -> Result<Vec<u8>, UploadError> {
        (**self).upload(job)
    }
}
