// Redis-backed stores.
//
// Every check-and-set runs server side (SET NX or a Lua script), so the
// guarantees hold across all instances pointing at the same Redis.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::trait_def::*;
use crate::error::{WebhookError, WebhookResult};
use crate::ledger::{LedgerEntry, LedgerStatus};

const COMPARE_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

// KEYS: index, row, all. ARGV: id, entry, status, updated_at, score.
const LEDGER_INSERT: &str = r"
local existing = redis.call('GET', KEYS[1])
if existing then
    return existing
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], 'entry', ARGV[2], 'status', ARGV[3], 'updated_at', ARGV[4], 'reset_count', '0')
redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
return false
";

// KEYS: row. ARGV: to, error, updated_at, count_reset, expected...
const LEDGER_TRANSITION: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    return {0, ''}
end
for i = 5, #ARGV do
    if ARGV[i] == status then
        redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updated_at', ARGV[3])
        if ARGV[2] == '' then
            redis.call('HDEL', KEYS[1], 'error')
        else
            redis.call('HSET', KEYS[1], 'error', ARGV[2])
        end
        if ARGV[4] == '1' then
            redis.call('HINCRBY', KEYS[1], 'reset_count', 1)
        end
        return {1, ARGV[1]}
    end
end
return {2, status}
";

async fn connection(client: &redis::Client) -> WebhookResult<redis::aio::MultiplexedConnection> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| WebhookError::Store(format!("Failed to get Redis connection: {}", e)))
}

/// Redis implementation of [`SharedStore`].
#[derive(Clone)]
pub struct RedisSharedStore {
    client: redis::Client,
    prefix: String,
    compare_delete: redis::Script,
}

impl RedisSharedStore {
    /// Creates a store from a connection URL.
    pub fn new(url: &str) -> WebhookResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| WebhookError::Store(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self {
            client,
            prefix: "hookgate:".to_string(),
            compare_delete: redis::Script::new(COMPARE_DELETE),
        }
    }

    /// Sets the key prefix (default `hookgate:`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> WebhookResult<bool> {
        let mut conn = connection(&self.client).await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<Option<String>>(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn remove_if_value(&self, key: &str, value: &str) -> WebhookResult<bool> {
        let mut conn = connection(&self.client).await?;
        let removed: i64 = self
            .compare_delete
            .key(self.key(key))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn get(&self, key: &str) -> WebhookResult<Option<String>> {
        let mut conn = connection(&self.client).await?;
        let value = redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }
}

/// Redis implementation of [`LedgerStore`].
///
/// Each row is a hash holding the immutable entry as JSON plus its mutable
/// status fields. A string key per `(provider, event_id)` is the unique
/// index, and a sorted set orders rows by creation time for listing.
#[derive(Clone)]
pub struct RedisLedgerStore {
    client: redis::Client,
    prefix: String,
    insert: redis::Script,
    transition: redis::Script,
}

impl RedisLedgerStore {
    /// Creates a store from a connection URL.
    pub fn new(url: &str) -> WebhookResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| WebhookError::Store(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self {
            client,
            prefix: "hookgate:".to_string(),
            insert: redis::Script::new(LEDGER_INSERT),
            transition: redis::Script::new(LEDGER_TRANSITION),
        }
    }

    /// Sets the key prefix (default `hookgate:`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn row_key(&self, id: Uuid) -> String {
        format!("{}ledger:row:{}", self.prefix, id)
    }

    // Length-prefixed so a ':' inside either part cannot alias another pair
    fn index_key(&self, provider: &str, event_id: &str) -> String {
        format!("{}ledger:event:{}:{}:{}", self.prefix, provider.len(), provider, event_id)
    }

    fn all_key(&self) -> String {
        format!("{}ledger:all", self.prefix)
    }

    async fn load(&self, conn: &mut redis::aio::MultiplexedConnection, id: Uuid) -> WebhookResult<Option<LedgerEntry>> {
        let fields = redis::cmd("HGETALL")
            .arg(self.row_key(id))
            .query_async::<HashMap<String, String>>(conn)
            .await?;
        decode_row(fields)
    }
}

fn decode_row(fields: HashMap<String, String>) -> WebhookResult<Option<LedgerEntry>> {
    let Some(raw) = fields.get("entry") else {
        return Ok(None);
    };

    let mut entry: LedgerEntry = serde_json::from_str(raw)
        .map_err(|e| WebhookError::Store(format!("Corrupt ledger row: {}", e)))?;

    if let Some(status) = fields.get("status") {
        entry.status = status.parse::<LedgerStatus>()?;
    }
    entry.error = fields.get("error").cloned();
    if let Some(updated_at) = fields.get("updated_at") {
        entry.updated_at = DateTime::parse_from_rfc3339(updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| WebhookError::Store(format!("Corrupt ledger timestamp: {}", e)))?;
    }
    if let Some(reset_count) = fields.get("reset_count") {
        entry.reset_count = reset_count.parse().unwrap_or_default();
    }

    Ok(Some(entry))
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn insert_if_absent(&self, entry: LedgerEntry) -> WebhookResult<LedgerInsert> {
        let mut conn = connection(&self.client).await?;
        let encoded = serde_json::to_string(&entry)
            .map_err(|e| WebhookError::Store(format!("Failed to encode ledger row: {}", e)))?;

        let existing: Option<String> = self
            .insert
            .key(self.index_key(&entry.provider, &entry.event_id))
            .key(self.row_key(entry.id))
            .key(self.all_key())
            .arg(entry.id.to_string())
            .arg(encoded)
            .arg(entry.status.as_str())
            .arg(entry.updated_at.to_rfc3339())
            .arg(entry.created_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let Some(existing_id) = existing else {
            return Ok(LedgerInsert::Inserted(entry));
        };

        let existing_id = Uuid::parse_str(&existing_id)
            .map_err(|e| WebhookError::Store(format!("Corrupt ledger index: {}", e)))?;
        let row = self
            .load(&mut conn, existing_id)
            .await?
            .ok_or_else(|| WebhookError::LedgerEntryNotFound(existing_id.to_string()))?;
        Ok(LedgerInsert::Existing(row))
    }

    async fn get(&self, id: Uuid) -> WebhookResult<Option<LedgerEntry>> {
        let mut conn = connection(&self.client).await?;
        self.load(&mut conn, id).await
    }

    async fn find(&self, provider: &str, event_id: &str) -> WebhookResult<Option<LedgerEntry>> {
        let mut conn = connection(&self.client).await?;
        let id = redis::cmd("GET")
            .arg(self.index_key(provider, event_id))
            .query_async::<Option<String>>(&mut conn)
            .await?;

        match id.map(|raw| Uuid::parse_str(&raw)) {
            None => Ok(None),
            Some(Ok(id)) => self.load(&mut conn, id).await,
            Some(Err(e)) => Err(WebhookError::Store(format!("Corrupt ledger index: {}", e))),
        }
    }

    async fn update_status(&self, id: Uuid, change: StatusChange) -> WebhookResult<LedgerEntry> {
        let mut conn = connection(&self.client).await?;

        let mut invocation = self.transition.key(self.row_key(id));
        invocation
            .arg(change.to.as_str())
            .arg(change.error.as_deref().unwrap_or(""))
            .arg(change.at.to_rfc3339())
            .arg(if change.count_reset { "1" } else { "0" });
        for status in &change.expected {
            invocation.arg(status.as_str());
        }

        let (code, status): (i64, String) = invocation.invoke_async(&mut conn).await?;
        match code {
            0 => Err(WebhookError::LedgerEntryNotFound(id.to_string())),
            1 => self
                .load(&mut conn, id)
                .await?
                .ok_or_else(|| WebhookError::LedgerEntryNotFound(id.to_string())),
            _ => Err(WebhookError::InvalidTransition {
                id: id.to_string(),
                from: status.parse()?,
                to: change.to,
            }),
        }
    }

    async fn list(&self, query: &LedgerQuery) -> WebhookResult<Vec<LedgerEntry>> {
        let mut conn = connection(&self.client).await?;
        let ids = redis::cmd("ZRANGE")
            .arg(self.all_key())
            .arg(0)
            .arg(-1)
            .query_async::<Vec<String>>(&mut conn)
            .await?;

        let mut rows = Vec::new();
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                continue;
            };
            if let Some(row) = self.load(&mut conn, id).await? {
                if query.matches(&row) {
                    rows.push(row);
                    if query.limit.is_some_and(|limit| rows.len() >= limit) {
                        break;
                    }
                }
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_prefix() -> String {
        format!("hookgate-test:{}:", Uuid::new_v4())
    }

    #[test]
    fn test_index_key_is_unambiguous() {
        let client = redis::Client::open(redis_url()).unwrap();
        let store = RedisLedgerStore::from_client(client);

        assert_ne!(store.index_key("a:b", "c"), store.index_key("a", "b:c"));
        assert_eq!(store.index_key("stripe", "evt_1"), "hookgate:ledger:event:6:stripe:evt_1");
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_redis_insert_if_absent() {
        let store = RedisSharedStore::new(&redis_url()).unwrap().with_prefix(test_prefix());

        assert!(store.insert_if_absent("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.insert_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
        assert!(!store.remove_if_value("k", "b").await.unwrap());
        assert!(store.remove_if_value("k", "a").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_redis_ledger_lifecycle() {
        let store = RedisLedgerStore::new(&redis_url()).unwrap().with_prefix(test_prefix());
        let entry = LedgerEntry::new("stripe", "evt_1", "invoice.paid", json!({"items": []}), None, Utc::now());
        let id = entry.id;

        assert!(matches!(store.insert_if_absent(entry.clone()).await.unwrap(), LedgerInsert::Inserted(_)));
        let duplicate = LedgerEntry::new("stripe", "evt_1", "invoice.paid", json!({}), None, Utc::now());
        match store.insert_if_absent(duplicate).await.unwrap() {
            LedgerInsert::Existing(row) => {
                assert_eq!(row.id, id);
                assert_eq!(row.payload, json!({"items": []}));
            }
            LedgerInsert::Inserted(_) => panic!("expected existing row"),
        }

        let processed = store
            .update_status(
                id,
                StatusChange::new(&[LedgerStatus::Received], LedgerStatus::Processed, Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(processed.status, LedgerStatus::Processed);

        let err = store
            .update_status(
                id,
                StatusChange::new(&[LedgerStatus::Received], LedgerStatus::Errored, Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidTransition { .. }));
    }
}
