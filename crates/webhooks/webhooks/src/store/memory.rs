use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::trait_def::*;
use crate::clock::{Clock, SystemClock};
use crate::error::{WebhookError, WebhookResult};
use crate::ledger::LedgerEntry;

/// Entries kept before expired keys are swept on insert.
const PRUNE_THRESHOLD: usize = 4096;

/// In-memory implementation of [`SharedStore`].
///
/// Guarantees hold within one process only. Expired keys are treated as
/// absent and swept lazily.
#[derive(Debug)]
pub struct MemorySharedStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a store that reads expiry time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries.values().filter(|(_, expires_at)| *expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::milliseconds(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> WebhookResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        if entries.len() >= PRUNE_THRESHOLD {
            entries.retain(|_, (_, expires_at)| *expires_at > now);
        }

        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(key.to_string(), (value.to_string(), expiry(now, ttl)));
        Ok(true)
    }

    async fn remove_if_value(&self, key: &str, value: &str) -> WebhookResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some((stored, expires_at)) if stored == value && *expires_at > now => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> WebhookResult<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }
}

#[derive(Debug, Default)]
struct LedgerTable {
    rows: HashMap<Uuid, LedgerEntry>,
    by_event: HashMap<(String, String), Uuid>,
}

/// In-memory implementation of [`LedgerStore`].
///
/// One lock guards both the rows and the `(provider, event_id)` index, so the
/// conditional insert is a single atomic step.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    table: RwLock<LedgerTable>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows.
    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_if_absent(&self, entry: LedgerEntry) -> WebhookResult<LedgerInsert> {
        let mut table = self.table.write().await;
        let natural_key = (entry.provider.clone(), entry.event_id.clone());

        if let Some(existing) = table.by_event.get(&natural_key).and_then(|id| table.rows.get(id)) {
            return Ok(LedgerInsert::Existing(existing.clone()));
        }

        table.by_event.insert(natural_key, entry.id);
        table.rows.insert(entry.id, entry.clone());
        Ok(LedgerInsert::Inserted(entry))
    }

    async fn get(&self, id: Uuid) -> WebhookResult<Option<LedgerEntry>> {
        let table = self.table.read().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn find(&self, provider: &str, event_id: &str) -> WebhookResult<Option<LedgerEntry>> {
        let table = self.table.read().await;
        Ok(table
            .by_event
            .get(&(provider.to_string(), event_id.to_string()))
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn update_status(&self, id: Uuid, change: StatusChange) -> WebhookResult<LedgerEntry> {
        let mut table = self.table.write().await;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| WebhookError::LedgerEntryNotFound(id.to_string()))?;

        if !change.expected.contains(&row.status) {
            return Err(WebhookError::InvalidTransition {
                id: id.to_string(),
                from: row.status,
                to: change.to,
            });
        }

        row.status = change.to;
        row.error = change.error;
        row.updated_at = change.at;
        if change.count_reset {
            row.reset_count += 1;
        }
        Ok(row.clone())
    }

    async fn list(&self, query: &LedgerQuery) -> WebhookResult<Vec<LedgerEntry>> {
        let table = self.table.read().await;
        let mut rows: Vec<LedgerEntry> = table
            .rows
            .values()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();

        rows.sort_by_key(|row| row.created_at);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}
