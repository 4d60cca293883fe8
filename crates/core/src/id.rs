//! Strongly-typed identifiers used across the pipeline.
//!
//! Identifiers are opaque tokens on the wire. Freshly minted ids are UUIDv7 text, but any
//! token made of ASCII letters, digits, `-` and `_` (at most [`MAX_ID_LEN`] bytes) is
//! accepted so that ids minted by other producers survive a round trip.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

/// Longest identifier accepted from the outside world.
pub const MAX_ID_LEN: usize = 128;

/// Identifier of one upload job (the handle returned to the submitter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadId(String);

/// Identifier of the post an attachment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostId(String);

fn validate_token(name: &str, raw: &str) -> DomainResult<()> {
    if raw.is_empty() {
        return Err(DomainError::invalid_id(format!("{name}: empty")));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(DomainError::invalid_id(format!(
            "{name}: longer than {MAX_ID_LEN} bytes"
        )));
    }
    if let Some(bad) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(DomainError::invalid_id(format!(
            "{name}: unexpected character {bad:?}"
        )));
    }
    Ok(())
}

macro_rules! impl_token_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Mint a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer parsing fixed ids in tests for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn parse(raw: &str) -> DomainResult<Self> {
                validate_token($name, raw)?;
                Ok(Self(raw.to_owned()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                validate_token($name, &value)?;
                Ok(Self(value))
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_token_newtype!(UploadId, "UploadId");
impl_token_newtype!(PostId, "PostId");
