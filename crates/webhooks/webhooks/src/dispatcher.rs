//! The business-effect seam.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a [`Dispatcher`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DispatchError {
    pub message: String,
    /// Hint that a later attempt may succeed.
    pub retryable: bool,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Applies the business effect of a verified, de-duplicated event.
///
/// The pipeline calls `apply` at most once per ledger row, while holding the
/// event's scope lock. The payload is passed through uninterpreted.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn apply(&self, event_type: &str, payload: &Value, org_scope: Option<&str>) -> Result<(), DispatchError>;
}
