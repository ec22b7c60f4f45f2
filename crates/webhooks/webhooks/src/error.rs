//! Webhook error types.
//!
//! Every failure the inbound pipeline can produce is a [`WebhookError`]
//! variant. A duplicate delivery is not among them: it is reported as a
//! successful no-op through [`RecordOutcome::Duplicate`](crate::RecordOutcome).

use thiserror::Error;

use crate::ledger::LedgerStatus;

/// Result type for webhook operations.
pub type WebhookResult<T> = Result<T, WebhookError>;

/// Error type for webhook operations.
#[derive(Debug, Error)]
pub enum WebhookError {
    // ==================== Verification Errors ====================
    /// The signature does not match any trusted secret.
    #[error("Invalid signature")]
    SignatureInvalid,

    /// A required header was not supplied.
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// The timestamp is neither epoch seconds nor ISO-8601.
    #[error("Malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// The timestamp is older than the allowed skew.
    #[error("Timestamp is {skew_secs}s old, beyond the allowed {max_skew_secs}s")]
    StaleTimestamp { skew_secs: i64, max_skew_secs: i64 },

    /// The timestamp is further in the future than the allowed skew.
    #[error("Timestamp is {skew_secs}s in the future, beyond the allowed {max_skew_secs}s")]
    FutureTimestamp { skew_secs: i64, max_skew_secs: i64 },

    /// The content type is not in the allowed set.
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    // ==================== Duplicate Suppression ====================
    /// The (signature, timestamp) pair was already consumed.
    #[error("Replay detected")]
    ReplayDetected,

    /// The idempotency key was already used.
    #[error("Idempotency key already used: {0}")]
    IdempotencyConflict(String),

    /// The idempotency key failed format validation.
    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    /// The verified body could not be read as an event.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // ==================== Ledger Errors ====================
    /// The ledger could not be written.
    #[error("Ledger write failed: {0}")]
    LedgerWriteFailure(String),

    /// No ledger entry exists with the given id.
    #[error("Ledger entry not found: {0}")]
    LedgerEntryNotFound(String),

    /// The requested status change would move an entry backwards.
    #[error("Ledger entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: LedgerStatus,
        to: LedgerStatus,
    },

    // ==================== Processing Errors ====================
    /// Another delivery holds the scope lock.
    #[error("Scope lock unavailable: {0}")]
    LockUnavailable(String),

    /// The dispatcher failed; the failure is recorded on the ledger entry.
    #[error("Dispatch failed for ledger entry {ledger_id}: {message}")]
    DispatchFailure { ledger_id: String, message: String },

    /// The pipeline deadline elapsed before dispatch completed.
    #[error("Deadline exceeded for ledger entry {ledger_id}")]
    DeadlineExceeded { ledger_id: String },

    // ==================== Infrastructure ====================
    /// Shared store error.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WebhookError {
    /// Returns true if the request was refused before it reached the ledger.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid
                | Self::MissingHeader(_)
                | Self::MalformedTimestamp(_)
                | Self::StaleTimestamp { .. }
                | Self::FutureTimestamp { .. }
                | Self::UnsupportedContentType(_)
                | Self::ReplayDetected
                | Self::IdempotencyConflict(_)
                | Self::InvalidIdempotencyKey(_)
                | Self::InvalidPayload(_)
        )
    }

    /// Returns true if the business effect failed after the event was recorded.
    pub fn is_recorded_failure(&self) -> bool {
        matches!(self, Self::DispatchFailure { .. } | Self::DeadlineExceeded { .. })
    }

    /// Returns an HTTP status code appropriate for this error.
    ///
    /// Recorded dispatch failures report `500` here; the pipeline may answer
    /// differently according to its
    /// [`DispatchFailurePolicy`](crate::DispatchFailurePolicy).
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SignatureInvalid
            | Self::MissingHeader(_)
            | Self::StaleTimestamp { .. }
            | Self::FutureTimestamp { .. } => 401,
            Self::MalformedTimestamp(_)
            | Self::UnsupportedContentType(_)
            | Self::InvalidIdempotencyKey(_)
            | Self::InvalidPayload(_) => 400,
            Self::ReplayDetected | Self::IdempotencyConflict(_) => 409,
            Self::LockUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// Returns a stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "invalid_signature",
            Self::MissingHeader(_) => "missing_header",
            Self::MalformedTimestamp(_) => "malformed_timestamp",
            Self::StaleTimestamp { .. } => "stale_timestamp",
            Self::FutureTimestamp { .. } => "future_timestamp",
            Self::UnsupportedContentType(_) => "unsupported_content_type",
            Self::ReplayDetected => "replay_detected",
            Self::IdempotencyConflict(_) => "idempotency_conflict",
            Self::InvalidIdempotencyKey(_) => "invalid_idempotency_key",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::LedgerWriteFailure(_) => "ledger_write_failed",
            Self::LedgerEntryNotFound(_) => "ledger_entry_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::LockUnavailable(_) => "lock_unavailable",
            Self::DispatchFailure { .. } => "dispatch_failed",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Store(_) => "store_error",
            Self::Config(_) => "configuration_error",
        }
    }
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::InvalidPayload(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for WebhookError {
    fn from(err: redis::RedisError) -> Self {
        WebhookError::Store(err.to_string())
    }
}
