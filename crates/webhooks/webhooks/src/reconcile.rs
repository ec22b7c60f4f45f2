//! Reconciliation sweep over the event ledger.
//!
//! Finds rows a crashed or failed delivery left behind and resets them so
//! the next delivery of the same event processes them again.

use chrono::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::WebhookResult;
use crate::ledger::{EventLedger, LedgerEntry, LedgerStatus};
use crate::store::LedgerQuery;

/// Ledger maintenance for an external sweep job.
#[derive(Clone)]
pub struct Reconciler {
    ledger: EventLedger,
}

impl Reconciler {
    pub fn new(ledger: EventLedger) -> Self {
        Self { ledger }
    }

    /// Rows still `received` or `processing` that have not moved for
    /// `older_than`.
    pub async fn stuck(&self, older_than: Duration) -> WebhookResult<Vec<LedgerEntry>> {
        let query = LedgerQuery {
            statuses: vec![LedgerStatus::Received, LedgerStatus::Processing],
            updated_before: Some(self.ledger.clock().now() - older_than),
            ..Default::default()
        };
        self.ledger.store().list(&query).await
    }

    /// Up to `limit` errored rows, oldest first.
    pub async fn errored(&self, limit: usize) -> WebhookResult<Vec<LedgerEntry>> {
        let query = LedgerQuery {
            statuses: vec![LedgerStatus::Errored],
            limit: Some(limit),
            ..Default::default()
        };
        self.ledger.store().list(&query).await
    }

    /// Moves a row back to `received`, clearing its error.
    pub async fn reset(&self, id: Uuid) -> WebhookResult<LedgerEntry> {
        let entry = self.ledger.reset(id).await?;
        tracing::info!(
            ledger_id = %entry.id,
            provider = %entry.provider,
            event_id = %entry.event_id,
            reset_count = entry.reset_count,
            "Ledger entry reset"
        );
        Ok(entry)
    }

    /// Resets every `processing` row stuck for `older_than`.
    ///
    /// Stuck `received` rows need no reset; the next delivery resumes them.
    /// Returns the number of rows reset.
    pub async fn reset_stuck(&self, older_than: Duration) -> WebhookResult<usize> {
        let mut reset = 0;
        for entry in self.stuck(older_than).await? {
            if entry.status == LedgerStatus::Processing {
                self.reset(entry.id).await?;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryLedgerStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded() -> (Reconciler, EventLedger, FixedClock) {
        let clock = FixedClock::at_secs(1_700_000_000);
        let ledger = EventLedger::new(Arc::new(MemoryLedgerStore::new()), Arc::new(clock.clone()));
        (Reconciler::new(ledger.clone()), ledger, clock)
    }

    #[tokio::test]
    async fn test_stuck_rows_by_age() {
        let (reconciler, ledger, clock) = seeded().await;

        let received = ledger
            .record_received("stripe", "evt_1", "invoice.paid", json!({}), None)
            .await
            .unwrap()
            .id();
        let processing = ledger
            .record_received("stripe", "evt_2", "invoice.paid", json!({}), None)
            .await
            .unwrap()
            .id();
        ledger.claim(processing).await.unwrap();
        let done = ledger
            .record_received("stripe", "evt_3", "invoice.paid", json!({}), None)
            .await
            .unwrap()
            .id();
        ledger.mark_processed(done).await.unwrap();

        assert!(reconciler.stuck(Duration::minutes(5)).await.unwrap().is_empty());

        clock.advance(Duration::minutes(10));
        let stuck: Vec<Uuid> = reconciler
            .stuck(Duration::minutes(5))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(stuck.len(), 2);
        assert!(stuck.contains(&received));
        assert!(stuck.contains(&processing));

        assert_eq!(reconciler.reset_stuck(Duration::minutes(5)).await.unwrap(), 1);
        assert_eq!(ledger.get(processing).await.unwrap().status, LedgerStatus::Received);
    }

    #[tokio::test]
    async fn test_errored_rows_can_be_reset() {
        let (reconciler, ledger, _) = seeded().await;
        let id = ledger
            .record_received("stripe", "evt_1", "invoice.paid", json!({}), None)
            .await
            .unwrap()
            .id();
        ledger.mark_errored(id, "boom").await.unwrap();

        let errored = reconciler.errored(10).await.unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].error.as_deref(), Some("boom"));

        let reset = reconciler.reset(id).await.unwrap();
        assert_eq!(reset.status, LedgerStatus::Received);
        assert!(reconciler.errored(10).await.unwrap().is_empty());
    }
}
