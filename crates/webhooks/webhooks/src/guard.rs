//! Replay and idempotency guards.
//!
//! Both guards are an atomic consume-once check over a TTL-bounded key space
//! in a [`SharedStore`]. They are independent: a request can pass one and
//! fail the other.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{WebhookError, WebhookResult};
use crate::receiver::VerifiedRequest;
use crate::store::SharedStore;

/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Configuration for [`RequestGuards`].
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Reject a second request carrying an already consumed
    /// (signature, timestamp) pair.
    pub replay_enabled: bool,
    /// How long a consumed (signature, timestamp) pair is remembered.
    pub replay_ttl: Duration,
    /// Reject reuse of an `Idempotency-Key` header.
    pub idempotency_enabled: bool,
    /// How long a consumed idempotency key is remembered.
    pub idempotency_ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            replay_enabled: false,
            replay_ttl: Duration::from_secs(600),
            idempotency_enabled: true,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl GuardConfig {
    /// Enables the replay guard with the given TTL.
    pub fn replay(mut self, ttl: Duration) -> Self {
        self.replay_enabled = true;
        self.replay_ttl = ttl;
        self
    }

    /// Enables the idempotency guard with the given TTL.
    pub fn idempotency(mut self, ttl: Duration) -> Self {
        self.idempotency_enabled = true;
        self.idempotency_ttl = ttl;
        self
    }

    /// Disables the idempotency guard.
    pub fn without_idempotency(mut self) -> Self {
        self.idempotency_enabled = false;
        self
    }
}

/// A claim on a guard key, tagged with a unique token so only its owner can
/// give it back.
#[derive(Debug, Clone)]
struct GuardClaim {
    key: String,
    token: String,
}

#[derive(Clone)]
struct ConsumeOnce {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    namespace: &'static str,
}

impl ConsumeOnce {
    async fn claim(&self, raw_key: &str) -> WebhookResult<Option<GuardClaim>> {
        let claim = GuardClaim {
            key: format!("{}:{}", self.namespace, raw_key),
            token: Uuid::new_v4().to_string(),
        };
        let fresh = self.store.insert_if_absent(&claim.key, &claim.token, self.ttl).await?;
        Ok(fresh.then_some(claim))
    }
}

/// Blocks reuse of an accepted (signature, timestamp) pair.
#[derive(Clone)]
pub struct ReplayGuard {
    inner: ConsumeOnce,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self {
            inner: ConsumeOnce {
                store,
                ttl,
                namespace: "replay",
            },
        }
    }

    /// Returns true only for the first caller with this pair within the TTL.
    pub async fn check_and_consume(&self, signature: &str, timestamp: i64) -> WebhookResult<bool> {
        Ok(self.claim(signature, timestamp).await?.is_some())
    }

    async fn claim(&self, signature: &str, timestamp: i64) -> WebhookResult<Option<GuardClaim>> {
        self.inner
            .claim(&format!("{}:{}", timestamp, signature.to_ascii_lowercase()))
            .await
    }
}

/// A validated, case-normalized idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Trims and lowercases `raw`, then checks its length and characters.
    ///
    /// Allowed characters are ASCII letters, digits and `-_.:`.
    pub fn parse(raw: &str) -> WebhookResult<Self> {
        let normalized = raw.trim().to_ascii_lowercase();

        if normalized.is_empty() {
            return Err(WebhookError::InvalidIdempotencyKey("key is empty".into()));
        }
        if normalized.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(WebhookError::InvalidIdempotencyKey(format!(
                "key exceeds {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(WebhookError::InvalidIdempotencyKey(format!(
                "unexpected character {:?}",
                bad
            )));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Blocks reuse of a caller-supplied idempotency key.
#[derive(Clone)]
pub struct IdempotencyGuard {
    inner: ConsumeOnce,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self {
            inner: ConsumeOnce {
                store,
                ttl,
                namespace: "idem",
            },
        }
    }

    /// Returns true only for the first caller with this key within the TTL.
    pub async fn check_and_consume(&self, key: &IdempotencyKey) -> WebhookResult<bool> {
        Ok(self.inner.claim(key.as_str()).await?.is_some())
    }
}

/// Guard keys consumed for one request.
#[derive(Debug, Default)]
pub struct Admission {
    claims: Vec<GuardClaim>,
}

impl Admission {
    /// Number of guard keys this request consumed.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// The guards configured for a pipeline.
#[derive(Clone)]
pub struct RequestGuards {
    store: Arc<dyn SharedStore>,
    replay: Option<ReplayGuard>,
    idempotency: Option<IdempotencyGuard>,
}

impl RequestGuards {
    pub fn new(store: Arc<dyn SharedStore>, config: &GuardConfig) -> Self {
        Self {
            replay: config
                .replay_enabled
                .then(|| ReplayGuard::new(store.clone(), config.replay_ttl)),
            idempotency: config
                .idempotency_enabled
                .then(|| IdempotencyGuard::new(store.clone(), config.idempotency_ttl)),
            store,
        }
    }

    /// Consumes the guard keys for a verified request.
    ///
    /// On a collision, any key this call already consumed is given back and
    /// the collision is returned as an error.
    pub async fn admit(
        &self,
        verified: &VerifiedRequest,
        idempotency_key: Option<&IdempotencyKey>,
    ) -> WebhookResult<Admission> {
        let mut admission = Admission::default();

        if let Some(replay) = &self.replay {
            match replay.claim(&verified.signature, verified.timestamp).await? {
                Some(claim) => admission.claims.push(claim),
                None => return Err(WebhookError::ReplayDetected),
            }
        }

        if let (Some(guard), Some(key)) = (&self.idempotency, idempotency_key) {
            match guard.inner.claim(key.as_str()).await {
                Ok(Some(claim)) => admission.claims.push(claim),
                Ok(None) => {
                    self.revoke(admission).await;
                    return Err(WebhookError::IdempotencyConflict(key.as_str().to_string()));
                }
                Err(e) => {
                    self.revoke(admission).await;
                    return Err(e);
                }
            }
        }

        Ok(admission)
    }

    /// Gives back the keys of an admission so the sender may retry.
    ///
    /// Keys re-claimed by someone else after expiry are left alone.
    pub async fn revoke(&self, admission: Admission) {
        for claim in admission.claims {
            if let Err(e) = self.store.remove_if_value(&claim.key, &claim.token).await {
                tracing::warn!(error = %e, "Failed to release guard key");
            }
        }
    }
}
