//! HTTP object storage uploader.
//!
//! Objects are written with `PUT {base_url}/{post_id}/{upload_id}/{file_name}`.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use tracing::instrument;

use postline_core::UploadJob;

use super::{UploadError, Uploader};

pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct HttpObjectUploader {
    base_url: Url,
    timeout: Duration,
    // Built on first use so the blocking client is created on the worker thread.
    client: Mutex<Option<reqwest::blocking::Client>>,
}

impl HttpObjectUploader {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UploadError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| UploadError::Config(format!("base url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(UploadError::Config(format!("{base_url} cannot be a base url")));
        }
        Ok(Self {
            base_url,
            timeout,
            client: Mutex::new(None),
        })
    }

    pub fn object_url(&self, job: &UploadJob) -> Result<Url, UploadError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::Config(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend([
                job.post_id().as_str(),
                job.upload_id().as_str(),
                job.file_name(),
            ]);
        Ok(url)
    }

    fn client(&self) -> Result<reqwest::blocking::Client, UploadError> {
        let mut slot = self
            .client
            .lock()
            .map_err(|_| UploadError::Transport("client slot poisoned".to_string()))?;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| UploadError::Config(e.to_string()))?;
        *slot = Some(client.clone());
        Ok(client)
    }
}

impl Uploader for HttpObjectUploader {
    #[instrument(
        skip(self, job),
        fields(upload_id = %job.upload_id(), bytes = job.file_data().len()),
        err
    )]
    fn upload(&self, job: &UploadJob) -> Result<Vec<u8>, UploadError> {
        let url = self.object_url(job)?;
        let response = self
            .client()?
            .put(url.clone())
            .header(CONTENT_TYPE, job.file_type())
            .body(job.file_data().to_vec())
            .send()
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| url.to_string());
        Ok(location.into_bytes())
    }
}
