//! Upload status state machine.
//!
//! ```text
//! pending ──▶ uploading ──▶ success
//!    │            │
//!    └────────────┴──────▶ failed
//! ```
//!
//! `pending` is never stored; an absent status record means pending. Terminal states
//! (`success`, `failed`) accept no further transitions.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Success,
    Failed,
}

impl UploadStatus {
    /// Wire literal stored in the status record and pushed to stream clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Success => "success",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Success | UploadStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            UploadStatus::Pending => 0,
            UploadStatus::Uploading => 1,
            UploadStatus::Success | UploadStatus::Failed => 2,
        }
    }

    /// Whether moving to `next` keeps the observed sequence monotonic.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn transition(self, next: UploadStatus) -> DomainResult<UploadStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::IllegalTransition {
                from: self.as_str().to_owned(),
                to: next.as_str().to_owned(),
            })
        }
    }
}

impl core::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "success" => Ok(UploadStatus::Success),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn literals_round_trip() {
        for s in [
            UploadStatus::Pending,
            UploadStatus::Uploading,
            UploadStatus::Success,
            UploadStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<UploadStatus>().unwrap(), s);
        }
        assert!("done".parse::<UploadStatus>().is_err());
    }

    #[test]
    fn terminal_states_are_sticky() {
        assert!(UploadStatus::Success.transition(UploadStatus::Failed).is_err());
        assert!(UploadStatus::Failed.transition(UploadStatus::Uploading).is_err());
        assert!(UploadStatus::Uploading.transition(UploadStatus::Pending).is_err());
        assert_eq!(
            UploadStatus::Pending.transition(UploadStatus::Uploading),
            Ok(UploadStatus::Uploading)
        );
    }

    fn any_status() -> impl Strategy<Value = UploadStatus> {
        prop_oneof![
            Just(UploadStatus::Pending),
            Just(UploadStatus::Uploading),
            Just(UploadStatus::Success),
            Just(UploadStatus::Failed),
        ]
    }

    proptest! {
        // Whatever writers attempt, the accepted history is a subsequence of
        // pending, uploading, {success | failed}.
        #[test]
        fn accepted_history_is_monotonic(attempts in proptest::collection::vec(any_status(), 0..24)) {
            let mut current = UploadStatus::Pending;
            let mut history = vec![current];
            for next in attempts {
                if let Ok(accepted) = current.transition(next) {
                    current = accepted;
                    history.push(current);
                }
            }

            prop_assert!(history.len() <= 3);
            prop_assert!(history.windows(2).all(|w| w[0].rank() < w[1].rank()));
            prop_assert!(history[..history.len() - 1].iter().all(|s| !s.is_terminal()));
        }
    }
}
