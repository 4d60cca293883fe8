//! The queued upload job message.
//!
//! Wire format (JSON object):
//!
//! ```json
//! {"upload_id":"u1","post_id":"p1","file_name":"a.txt","file_type":"text/plain",
//!  "file_data":"ZmlsZWRhdGE=","request_id":"r-1"}
//! ```
//!
//! `file_data` is standard base64. `request_id` may be absent.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{PostId, UploadId};

/// One attachment waiting to be transferred to object storage.
///
/// Immutable once published; the worker consumes it exactly as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadJob {
    upload_id: UploadId,
    post_id: PostId,
    file_name: String,
    file_type: String,
    #[serde(with = "base64_bytes")]
    file_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

impl UploadJob {
    pub fn new(
        upload_id: UploadId,
        post_id: PostId,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        file_data: Vec<u8>,
    ) -> DomainResult<Self> {
        let job = Self {
            upload_id,
            post_id,
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_data,
            request_id: None,
        };
        job.validate()?;
        Ok(job)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn validate(&self) -> DomainResult<()> {
        if self.file_name.trim().is_empty() {
            return Err(DomainError::validation("file_name must not be empty"));
        }
        if self.file_name.contains(['/', '\\']) || matches!(self.file_name.as_str(), "." | "..") {
            return Err(DomainError::validation("file_name must be a plain file name"));
        }
        if self.file_type.trim().is_empty() {
            return Err(DomainError::validation("file_type must not be empty"));
        }
        Ok(())
    }

    /// Encode for publication on the job queue.
    pub fn to_payload(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DomainError::malformed(e.to_string()))
    }

    /// Decode a delivered queue payload.
    pub fn from_payload(payload: &[u8]) -> DomainResult<Self> {
        let job: Self =
            serde_json::from_slice(payload).map_err(|e| DomainError::malformed(e.to_string()))?;
        job.validate()
            .map_err(|e| DomainError::malformed(e.to_string()))?;
        Ok(job)
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    pub fn post_id(&self) -> &PostId {
        &self.post_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_type(&self) -> &str {
        &self.file_type
    }

    pub fn file_data(&self) -> &[u8] {
        &self.file_data
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> UploadJob {
        UploadJob::new(
            UploadId::parse("u1").unwrap(),
            PostId::parse("p1").unwrap(),
            "a.txt",
            "text/plain",
            b"filedata".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn file_data_is_base64_on_the_wire() {
        let payload = sample().to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["file_data"], "ZmlsZWRhdGE=");
        assert_eq!(value["upload_id"], "u1");
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn decodes_payload_from_other_producers() {
        let raw = br#"{"upload_id":"u1","post_id":"p1","file_name":"a.txt","file_type":"text/plain","file_data":"ZmlsZWRhdGE=","request_id":"r-9"}"#;
        let job = UploadJob::from_payload(raw).unwrap();
        assert_eq!(job.file_data(), b"filedata");
        assert_eq!(job.request_id(), Some("r-9"));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(UploadJob::from_payload(b"not json").is_err());
        assert!(UploadJob::from_payload(br#"{"upload_id":"u1"}"#).is_err());
        let bad_b64 = br#"{"upload_id":"u1","post_id":"p1","file_name":"a","file_type":"t","file_data":"%%%"}"#;
        assert!(matches!(
            UploadJob::from_payload(bad_b64),
            Err(DomainError::MalformedPayload(_))
        ));
        let empty_name = br#"{"upload_id":"u1","post_id":"p1","file_name":"","file_type":"t","file_data":""}"#;
        assert!(UploadJob::from_payload(empty_name).is_err());
    }

    #[test]
    fn constructor_rejects_path_like_names() {
        let err = UploadJob::new(
            UploadId::new(),
            PostId::new(),
            "../secret",
            "text/plain",
            Vec::new(),
        );
        assert!(err.is_err());
    }

    proptest! {
        #[test]
        fn payload_preserves_every_field(
            upload in "[A-Za-z0-9_-]{1,40}",
            post in "[A-Za-z0-9_-]{1,40}",
            name in "[A-Za-z0-9._ -]{0,30}[A-Za-z0-9]",
            mime in "[a-z]{1,10}/[a-z0-9.+-]{1,20}",
            data in proptest::collection::vec(any::<u8>(), 0..512),
            request in proptest::option::of("[a-f0-9-]{1,36}"),
        ) {
            let mut job = UploadJob::new(
                UploadId::parse(&upload).unwrap(),
                PostId::parse(&post).unwrap(),
                name,
                mime,
                data,
            ).unwrap();
            if let Some(r) = request {
                job = job.with_request_id(r);
            }

            let decoded = UploadJob::from_payload(&job.to_payload().unwrap()).unwrap();
            prop_assert_eq!(decoded, job);
        }
    }
}
