//! Error types for lead sync
//!
//! Errors are classified by how the core recovers:
//! - Retryable: fetch failures, timeouts, malformed rows (keep last good state)
//! - Reverted: write failures (optimistic change rolled back)
//! - Rejected: caller errors that never touched local or remote state

use thiserror::Error;

/// Error types for sync, merge and write operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    // Retryable errors
    #[error("Fetch failed: {0}")]
    TransientFetch(String),

    #[error("Fetch timed out after {0} ms")]
    Timeout(u64),

    #[error("Malformed row: {0}")]
    Decode(String),

    // Reverted
    #[error("Write failed: {0}")]
    WriteConflict(String),

    #[error("Lead not found: {0}")]
    NotFound(String),

    // Rejected
    #[error("Lead {0} is controlled by the agent; take over before sending")]
    HandoffRequired(String),

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Field '{0}' is read-only")]
    ReadOnlyField(String),

    #[error("Handoff cannot be released from the dashboard")]
    HandoffIrreversible,

    #[error("Unknown pipeline stage: {0}")]
    UnknownStage(String),

    #[error("No open draft for lead {0}")]
    NoDraft(String),

    #[error("Change feed unavailable")]
    Unsupported,
}

impl SyncError {
    /// Returns true if the next scheduled trigger is expected to recover
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientFetch(_) | SyncError::Timeout(_) | SyncError::Decode(_)
        )
    }

    /// Returns true if an optimistic change was (or must be) rolled back
    pub fn is_reverted(&self) -> bool {
        matches!(self, SyncError::WriteConflict(_) | SyncError::NotFound(_))
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::TransientFetch(_) | SyncError::Timeout(_) => {
                "Showing the last loaded data. It will refresh automatically."
            }
            SyncError::Decode(_) => "Some records could not be read. They will be retried.",
            SyncError::WriteConflict(_) => "The change was not saved and has been undone.",
            SyncError::NotFound(_) => "This lead no longer exists. Reload the board.",
            SyncError::HandoffRequired(_) => "Take over the conversation to reply manually.",
            SyncError::EmptyMessage => "Type a message before sending.",
            SyncError::ReadOnlyField(_) => "This field is managed by the system.",
            SyncError::HandoffIrreversible => "Control stays with the operator once taken.",
            SyncError::UnknownStage(_) => "Pick one of the board columns.",
            SyncError::NoDraft(_) => "Open the lead before editing it.",
            SyncError::Unsupported => "Live updates are off; the board refreshes on a timer.",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

/// Serializable error representation for the presentation layer
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorPayload {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Retryable,
    Reverted,
    Rejected,
}

impl From<&SyncError> for SyncErrorPayload {
    fn from(err: &SyncError) -> Self {
        let error_type = if err.is_retryable() {
            ErrorType::Retryable
        } else if err.is_reverted() {
            ErrorType::Reverted
        } else {
            ErrorType::Rejected
        };

        SyncErrorPayload {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_errors_are_retryable() {
        assert!(SyncError::TransientFetch("boom".into()).is_retryable());
        assert!(SyncError::Timeout(10_000).is_retryable());
        assert!(!SyncError::WriteConflict("boom".into()).is_retryable());
        assert!(!SyncError::EmptyMessage.is_retryable());
    }

    #[test]
    fn test_payload_classification() {
        let payload = SyncErrorPayload::from(&SyncError::WriteConflict("409".into()));
        assert_eq!(payload.error_type, ErrorType::Reverted);
        assert!(!payload.can_retry);

        let payload = SyncErrorPayload::from(&SyncError::HandoffRequired("L1".into()));
        assert_eq!(payload.error_type, ErrorType::Rejected);
        assert!(payload.message.contains("L1"));
    }

    #[test]
    fn test_payload_serializes_camel_case() {
        let payload = SyncErrorPayload::from(&SyncError::Timeout(250));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["errorType"], "retryable");
        assert_eq!(json["canRetry"], true);
    }
}
