//! Durable record of each distinct inbound event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{WebhookError, WebhookResult};
use crate::store::{LedgerInsert, LedgerStore, StatusChange};

/// Processing status of a ledger entry.
///
/// Statuses only move forward: `received -> processing -> processed | errored`.
/// The one exception is a reconciliation reset back to `received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Recorded, not yet dispatched.
    Received,
    /// Claimed by a delivery that is dispatching it.
    Processing,
    /// The business effect was applied.
    Processed,
    /// The business effect failed; the error is kept on the row.
    Errored,
}

impl LedgerStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Processing => 1,
            Self::Processed | Self::Errored => 2,
        }
    }

    /// Returns true for `processed` and `errored`.
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Returns true if moving to `next` goes strictly forward.
    pub fn can_advance_to(self, next: LedgerStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "errored" => Ok(Self::Errored),
            other => Err(WebhookError::Store(format!("unknown ledger status: {}", other))),
        }
    }
}

/// One row of the event ledger, unique on `(provider, event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    /// Tenant the event belongs to, when known.
    pub org_scope: Option<String>,
    /// Event payload, never interpreted by the ledger.
    pub payload: Value,
    pub status: LedgerStatus,
    pub error: Option<String>,
    /// How many times reconciliation moved this row back to `received`.
    #[serde(default)]
    pub reset_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates a `received` entry with a fresh id.
    pub fn new(
        provider: impl Into<String>,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        org_scope: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            event_id: event_id.into(),
            event_type: event_type.into(),
            org_scope,
            payload,
            status: LedgerStatus::Received,
            error: None,
            reset_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whether `record_received` created a row or found one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    New,
    Duplicate,
}

/// Result of [`EventLedger::record_received`].
///
/// A duplicate is a successful no-op, not an error.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    /// First sighting of this event.
    New(LedgerEntry),
    /// The event was already recorded; carries the existing row.
    Duplicate(LedgerEntry),
}

impl RecordOutcome {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::New(_) => RecordKind::New,
            Self::Duplicate(_) => RecordKind::Duplicate,
        }
    }

    pub fn id(&self) -> Uuid {
        self.entry().id
    }

    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::New(entry) | Self::Duplicate(entry) => entry,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            Self::New(entry) | Self::Duplicate(entry) => entry,
        }
    }
}

/// Event ledger over a [`LedgerStore`].
#[derive(Clone)]
pub struct EventLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl EventLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records an event, or reports the row that already exists for it.
    ///
    /// The conditional insert is atomic, so concurrent first deliveries of
    /// one event produce exactly one `New`.
    pub async fn record_received(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        payload: Value,
        org_scope: Option<String>,
    ) -> WebhookResult<RecordOutcome> {
        let entry = LedgerEntry::new(provider, event_id, event_type, payload, org_scope, self.clock.now());

        match self.store.insert_if_absent(entry).await {
            Ok(LedgerInsert::Inserted(entry)) => {
                tracing::debug!(ledger_id = %entry.id, provider, event_id, "Recorded new event");
                Ok(RecordOutcome::New(entry))
            }
            Ok(LedgerInsert::Existing(entry)) => {
                tracing::debug!(
                    ledger_id = %entry.id,
                    provider,
                    event_id,
                    status = %entry.status,
                    "Event already recorded"
                );
                Ok(RecordOutcome::Duplicate(entry))
            }
            Err(e) => Err(WebhookError::LedgerWriteFailure(e.to_string())),
        }
    }

    /// Claims a `received` row for dispatch by moving it to `processing`.
    ///
    /// Returns false if the row was already claimed or finished.
    pub async fn claim(&self, id: Uuid) -> WebhookResult<bool> {
        let change = StatusChange::new(&[LedgerStatus::Received], LedgerStatus::Processing, self.clock.now());
        match self.store.update_status(id, change).await {
            Ok(_) => Ok(true),
            Err(WebhookError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Marks a row processed. Safe to call on a row that is already processed.
    pub async fn mark_processed(&self, id: Uuid) -> WebhookResult<LedgerEntry> {
        let change = StatusChange::new(
            &[LedgerStatus::Received, LedgerStatus::Processing],
            LedgerStatus::Processed,
            self.clock.now(),
        );
        match self.store.update_status(id, change).await {
            Err(WebhookError::InvalidTransition {
                from: LedgerStatus::Processed,
                ..
            }) => self.get(id).await,
            other => other,
        }
    }

    /// Marks a row errored and keeps the error detail on it.
    ///
    /// Safe to call on a row that is already errored; the first error is kept.
    pub async fn mark_errored(&self, id: Uuid, error: impl Into<String>) -> WebhookResult<LedgerEntry> {
        let change = StatusChange::new(
            &[LedgerStatus::Received, LedgerStatus::Processing],
            LedgerStatus::Errored,
            self.clock.now(),
        )
        .with_error(error);
        match self.store.update_status(id, change).await {
            Err(WebhookError::InvalidTransition {
                from: LedgerStatus::Errored,
                ..
            }) => self.get(id).await,
            other => other,
        }
    }

    /// Moves a non-`received` row back to `received` and clears its error.
    ///
    /// This is the only backward move and belongs to reconciliation.
    pub async fn reset(&self, id: Uuid) -> WebhookResult<LedgerEntry> {
        let change = StatusChange::new(
            &[LedgerStatus::Processing, LedgerStatus::Processed, LedgerStatus::Errored],
            LedgerStatus::Received,
            self.clock.now(),
        )
        .as_reset();
        self.store.update_status(id, change).await
    }

    /// Gets a row by id, failing if it does not exist.
    pub async fn get(&self, id: Uuid) -> WebhookResult<LedgerEntry> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| WebhookError::LedgerEntryNotFound(id.to_string()))
    }

    /// Gets a row by `(provider, event_id)`.
    pub async fn find(&self, provider: &str, event_id: &str) -> WebhookResult<Option<LedgerEntry>> {
        self.store.find(provider, event_id).await
    }

    pub(crate) fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
