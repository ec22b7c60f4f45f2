use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::WebhookResult;
use crate::ledger::{LedgerEntry, LedgerStatus};

/// TTL-bounded key-value store shared across instances.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Stores `value` under `key` unless a live entry already exists.
    ///
    /// Returns true only for the call that created the entry. Two concurrent
    /// callers with the same key never both observe true.
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> WebhookResult<bool>;

    /// Deletes `key` only if it currently holds `value`.
    ///
    /// Returns true if an entry was removed.
    async fn remove_if_value(&self, key: &str, value: &str) -> WebhookResult<bool>;

    /// Reads the live value under `key`.
    async fn get(&self, key: &str) -> WebhookResult<Option<String>>;
}

/// Result of a conditional ledger insert.
#[derive(Debug, Clone)]
pub enum LedgerInsert {
    /// A new row was created.
    Inserted(LedgerEntry),
    /// A row for the same `(provider, event_id)` already existed.
    Existing(LedgerEntry),
}

/// Compare-and-set status update.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// The update applies only while the row is in one of these statuses.
    pub expected: Vec<LedgerStatus>,
    /// Target status.
    pub to: LedgerStatus,
    /// Error detail to store; `None` clears it.
    pub error: Option<String>,
    /// Increments the row's reset counter.
    pub count_reset: bool,
    /// Becomes the row's `updated_at`.
    pub at: DateTime<Utc>,
}

impl StatusChange {
    /// Creates an update to `to` from any of `expected`.
    pub fn new(expected: &[LedgerStatus], to: LedgerStatus, at: DateTime<Utc>) -> Self {
        Self {
            expected: expected.to_vec(),
            to,
            error: None,
            count_reset: false,
            at,
        }
    }

    /// Attaches error detail.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Marks the update as a reconciliation reset.
    pub fn as_reset(mut self) -> Self {
        self.count_reset = true;
        self
    }
}

/// Filter for listing ledger rows.
#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    /// Only rows in one of these statuses (all when empty).
    pub statuses: Vec<LedgerStatus>,

    /// Only rows from this provider.
    pub provider: Option<String>,

    /// Only rows last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,

    /// Maximum number of rows to return.
    pub limit: Option<usize>,
}

impl LedgerQuery {
    /// Returns true if `entry` passes every filter.
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&entry.status) {
            return false;
        }
        if let Some(provider) = &self.provider {
            if &entry.provider != provider {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if entry.updated_at >= before {
                return false;
            }
        }
        true
    }
}

/// Persistent storage for the event ledger.
///
/// Rows are unique on `(provider, event_id)`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts `entry` unless a row with the same `(provider, event_id)`
    /// exists, reporting which happened in the same atomic step.
    async fn insert_if_absent(&self, entry: LedgerEntry) -> WebhookResult<LedgerInsert>;

    /// Gets a row by id.
    async fn get(&self, id: Uuid) -> WebhookResult<Option<LedgerEntry>>;

    /// Gets a row by its natural key.
    async fn find(&self, provider: &str, event_id: &str) -> WebhookResult<Option<LedgerEntry>>;

    /// Atomically applies `change` if the row's status is expected.
    ///
    /// Fails with `LedgerEntryNotFound` for an unknown id and with
    /// `InvalidTransition` when the current status is not expected.
    async fn update_status(&self, id: Uuid, change: StatusChange) -> WebhookResult<LedgerEntry>;

    /// Lists rows matching `query`, oldest first.
    async fn list(&self, query: &LedgerQuery) -> WebhookResult<Vec<LedgerEntry>>;
}
