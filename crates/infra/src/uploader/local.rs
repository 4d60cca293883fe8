//! Filesystem uploader for single-machine dev setups.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::instrument;

use postline_core::UploadJob;

use super::{UploadError, Uploader};

/// Writes objects to `{root}/{post_id}/{upload_id}/{file_name}`.
#[derive(Debug, Clone)]
pub struct LocalDirUploader {
    root: PathBuf,
}

impl LocalDirUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, job: &UploadJob) -> PathBuf {
        // Ids are validated tokens and file names carry no separators.
        self.root
            .join(job.post_id().as_str())
            .join(job.upload_id().as_str())
            .join(job.file_name())
    }
}

impl Uploader for LocalDirUploader {
    #[instrument(skip(self, job), fields(upload_id = %job.upload_id()), err)]
    fn upload(&self, job: &UploadJob) -> Result<Vec<u8>, UploadError> {
        let path = self.object_path(job);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| UploadError::Io(format!("{}: {e}", dir.display())))?;
        }
        fs::write(&path, job.file_data())
            .map_err(|e| UploadError::Io(format!("{}: {e}", path.display())))?;
        Ok(path.to_string_lossy().into_owned().into_bytes())
    }
}
