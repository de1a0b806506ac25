use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SchedulerPhase;

/// Broad error category used for retry decisions and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Transient network failure.
    Network,
    /// Request exceeded its time budget.
    Timeout,
    /// Rate-limited by the backend.
    RateLimited,
    /// Authentication/authorization failure.
    Auth,
    /// Backend rejected the request as invalid.
    Rejected,
    /// A fetched record was missing required fields.
    Malformed,
    /// A send did not reach the server.
    SendFailure,
    /// Caller violated the engine contract (for example enqueue before start).
    InvalidState,
    /// Internal bug or invariant break.
    Internal,
}

impl SyncErrorCategory {
    /// Transport-level failures are retried by the next scheduler tick.
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Auth
        )
    }
}

/// Stable error payload crossing the engine boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Network failure reported by a transport.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Network, "transport_error", message)
    }

    /// Request that ran past its time budget.
    pub fn timeout(operation: &str, budget: Duration) -> Self {
        Self::new(
            SyncErrorCategory::Timeout,
            "request_timeout",
            format!("{operation} did not complete within {} ms", budget.as_millis()),
        )
    }

    /// Build a standard contract-violation error.
    pub fn invalid_state(phase: SchedulerPhase, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::InvalidState,
            "invalid_state_transition",
            format!("cannot run '{action}' while scheduler is {phase:?}"),
        )
    }

    /// Request naming a conversation other than the one the engine owns.
    pub fn conversation_mismatch(expected: &str, actual: &str) -> Self {
        Self::new(
            SyncErrorCategory::InvalidState,
            "conversation_mismatch",
            format!("engine for '{expected}' received input for '{actual}'"),
        )
    }

    /// Internal lock poisoning or similar invariant break.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Internal, "internal_error", message)
    }
}

/// Map HTTP status codes to error categories for transport implementors.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 => SyncErrorCategory::Timeout,
        429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::Rejected,
        500..=599 => SyncErrorCategory::Network,
        _ => SyncErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(408), SyncErrorCategory::Timeout);
        assert_eq!(classify_http_status(429), SyncErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), SyncErrorCategory::Rejected);
        assert_eq!(classify_http_status(503), SyncErrorCategory::Network);
        assert_eq!(classify_http_status(700), SyncErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = SyncError::invalid_state(SchedulerPhase::Stopped, "enqueue");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::InvalidState);
        assert!(err.message.contains("enqueue"));
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn only_wire_failures_count_as_transport() {
        assert!(SyncErrorCategory::Network.is_transport());
        assert!(SyncErrorCategory::Timeout.is_transport());
        assert!(!SyncErrorCategory::Malformed.is_transport());
        assert!(!SyncErrorCategory::InvalidState.is_transport());
    }

    #[test]
    fn timeout_message_names_operation_and_budget() {
        let err = SyncError::timeout("fetch round", Duration::from_millis(2_500));
        assert_eq!(err.code, "request_timeout");
        assert_eq!(err.message, "fetch round did not complete within 2500 ms");
    }
}
