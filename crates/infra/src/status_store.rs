//! Upload status records on top of the shared cache.
//!
//! Key layout:
//! - `upload_status:<upload_id>` → status literal (`uploading`, `success`, `failed`)
//! - `upload_location:<upload_id>` → where a successful upload landed
//!
//! Both expire after the configured TTL (one hour by default). An absent status key
//! reads as `pending`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use postline_core::{UploadId, UploadStatus};

use crate::cache::{Cache, CacheError};

pub const STATUS_KEY_PREFIX: &str = "upload_status:";
pub const LOCATION_KEY_PREFIX: &str = "upload_location:";
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(60 * 60);

pub fn status_key(id: &UploadId) -> String {
    format!("{STATUS_KEY_PREFIX}{id}")
}

pub fn location_key(id: &UploadId) -> String {
    format!("{LOCATION_KEY_PREFIX}{id}")
}

#[derive(Clone)]
pub struct UploadStatusStore {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl core::fmt::Debug for UploadStatusStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UploadStatusStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl UploadStatusStore {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current status; a missing or expired record is `pending`.
    pub fn get(&self, id: &UploadId) -> Result<UploadStatus, CacheError> {
        let Some(raw) = self.cache.get(&status_key(id))? else {
            return Ok(UploadStatus::Pending);
        };
        match raw.parse::<UploadStatus>() {
            Ok(status) => Ok(status),
            Err(e) => {
                // Foreign writers share the namespace; treat garbage as "not started".
                warn!(upload_id = %id, value = %raw, error = %e, "unrecognised status value");
                Ok(UploadStatus::Pending)
            }
        }
    }

    /// Move the record to `next` if the state machine allows it.
    ///
    /// Get-then-set, not atomic: concurrent writers race and the last one wins. Returns
    /// whether a write happened; refused regressions are not errors.
    #[instrument(skip(self), fields(upload_id = %id, next = %next), err)]
    pub fn transition(&self, id: &UploadId, next: UploadStatus) -> Result<bool, CacheError> {
        let current = self.get(id)?;
        if !current.can_transition_to(next) {
            debug!(upload_id = %id, %current, %next, "status transition refused");
            return Ok(false);
        }
        self.cache.set(&status_key(id), next.as_str(), self.ttl)?;
        Ok(true)
    }

    pub fn record_location(&self, id: &UploadId, location: &str) -> Result<(), CacheError> {
        self.cache.set(&location_key(id), location, self.ttl)
    }

    pub fn location(&self, id: &UploadId) -> Result<Option<String>, CacheError> {
        self.cache.get(&location_key(id))
    }
}
