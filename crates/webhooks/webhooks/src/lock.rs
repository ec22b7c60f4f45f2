//! Short-lived mutual exclusion per processing scope.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{WebhookError, WebhookResult};
use crate::store::SharedStore;

/// The logical resource a delivery mutates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Scopes to the tenant when it is known, else to the event itself.
    pub fn for_event(provider: &str, org_scope: Option<&str>, event_id: &str) -> Self {
        match org_scope.filter(|org| !org.is_empty()) {
            Some(org) => Self(format!("{}:org:{}", provider, org)),
            None => Self(format!("{}:evt:{}", provider, event_id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub scope_key: ScopeKey,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Lock timing.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Longest a lock lives if it is never released.
    pub ttl: Duration,
    /// Longest `acquire` waits for a held lock.
    pub wait: Duration,
    /// Delay between attempts while waiting.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    /// Sets how long an unreleased lock lives.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the longest wait for a held lock.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the delay between attempts while waiting.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Scope locks over a [`SharedStore`].
///
/// A lock is a store key holding its owner's token; it expires after the
/// configured TTL so a crashed holder cannot starve the scope.
#[derive(Clone)]
pub struct ScopeLock {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl ScopeLock {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn store_key(scope_key: &ScopeKey) -> String {
        format!("lock:{}", scope_key)
    }

    /// Makes a single attempt to take the lock.
    pub async fn try_acquire(&self, scope_key: &ScopeKey) -> WebhookResult<Option<LockGuard>> {
        let owner = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .insert_if_absent(&Self::store_key(scope_key), &owner, self.config.ttl)
            .await?;
        if !acquired {
            return Ok(None);
        }

        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(self.config.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let token = LockToken {
            scope_key: scope_key.clone(),
            owner,
            expires_at,
        };
        Ok(Some(LockGuard {
            lock: self.clone(),
            token,
            released: AtomicBool::new(false),
        }))
    }

    /// Takes the lock, waiting at most the configured wait.
    pub async fn acquire(&self, scope_key: &ScopeKey) -> WebhookResult<LockGuard> {
        self.acquire_within(scope_key, self.config.wait).await
    }

    /// Takes the lock, waiting at most `wait`.
    ///
    /// Fails with `LockUnavailable` when the wait runs out.
    pub async fn acquire_within(&self, scope_key: &ScopeKey, wait: Duration) -> WebhookResult<LockGuard> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(scope_key).await? {
                tracing::debug!(scope = %scope_key, "Scope lock acquired");
                return Ok(guard);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(WebhookError::LockUnavailable(scope_key.to_string()));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Releases a lock if `token` still owns it. A no-op otherwise.
    pub async fn release(&self, token: &LockToken) -> WebhookResult<bool> {
        self.store
            .remove_if_value(&Self::store_key(&token.scope_key), &token.owner)
            .await
    }
}

/// A held scope lock.
///
/// Release explicitly with [`LockGuard::release`]; a guard that is dropped
/// unreleased simply expires after the TTL.
pub struct LockGuard {
    lock: ScopeLock,
    token: LockToken,
    released: AtomicBool,
}

impl LockGuard {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Releases the lock. Calling it again is a no-op.
    pub async fn release(&self) -> WebhookResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.lock.release(&self.token).await?;
        tracing::debug!(scope = %self.token.scope_key, "Scope lock released");
        Ok(())
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("token", &self.token)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}
