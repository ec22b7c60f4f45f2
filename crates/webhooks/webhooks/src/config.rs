//! Deployment settings loaded from the environment.

use chrono::DateTime;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{WebhookError, WebhookResult};
use crate::pipeline::{DispatchFailurePolicy, PipelineConfig};
use crate::signature::{SecretSet, parse_timestamp};

/// Prefix checked before the bare variable name.
pub const ENV_PREFIX: &str = "HOOKGATE_";

/// Get environment variable with HOOKGATE_ prefix, falling back to unprefixed version
///
/// Checks `HOOKGATE_{key}` first, then `{key}`.
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Secrets plus pipeline configuration for one deployment.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secrets: SecretSet,
    pub pipeline: PipelineConfig,
}

impl WebhookSettings {
    /// Loads settings from the process environment.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `WEBHOOK_SECRET` | current secret (required) |
    /// | `WEBHOOK_SECRET_NEXT` | rotation secret |
    /// | `WEBHOOK_SECRET_NEXT_EXPIRES_AT` | rotation expiry, epoch seconds or RFC 3339 |
    /// | `WEBHOOK_MAX_SKEW_SECS` | freshness window |
    /// | `WEBHOOK_ALLOWED_CONTENT_TYPES` | comma separated media types |
    /// | `WEBHOOK_REPLAY_TTL_SECS` | enables the replay guard with this TTL |
    /// | `WEBHOOK_IDEMPOTENCY_TTL_SECS` | idempotency guard TTL |
    /// | `WEBHOOK_LOCK_TTL_SECS` | scope lock TTL |
    /// | `WEBHOOK_LOCK_WAIT_MS` | longest wait for a scope lock |
    /// | `WEBHOOK_DEADLINE_MS` | overall pipeline deadline |
    /// | `WEBHOOK_DISPATCH_FAILURE_POLICY` | `acknowledge` or `retry` |
    ///
    /// Each is read as `HOOKGATE_{NAME}` first.
    pub fn from_env() -> WebhookResult<Self> {
        Self::from_lookup(get_env_with_prefix)
    }

    /// Loads settings through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> WebhookResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let current = read("WEBHOOK_SECRET")
            .ok_or_else(|| WebhookError::Config("WEBHOOK_SECRET is not set".into()))?;
        let mut secrets = SecretSet::new(current);

        if let Some(next) = read("WEBHOOK_SECRET_NEXT") {
            let raw = read("WEBHOOK_SECRET_NEXT_EXPIRES_AT").ok_or_else(|| {
                WebhookError::Config("WEBHOOK_SECRET_NEXT requires WEBHOOK_SECRET_NEXT_EXPIRES_AT".into())
            })?;
            let expires_at = parse_timestamp(&raw)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| WebhookError::Config(format!("invalid WEBHOOK_SECRET_NEXT_EXPIRES_AT: {}", raw)))?;
            secrets = secrets.with_next(next, expires_at);
        }

        let mut pipeline = PipelineConfig::default();

        if let Some(skew) = parse::<i64>(&read, "WEBHOOK_MAX_SKEW_SECS")? {
            pipeline.verify.max_skew_secs = skew;
            pipeline.guards.replay_ttl = Duration::from_secs(skew.unsigned_abs() * 2);
        }
        if let Some(types) = read("WEBHOOK_ALLOWED_CONTENT_TYPES") {
            pipeline.verify = pipeline.verify.allowed_content_types(
                types.split(',').map(str::trim).filter(|t| !t.is_empty()),
            );
        }
        if let Some(ttl) = parse::<u64>(&read, "WEBHOOK_REPLAY_TTL_SECS")? {
            pipeline.guards = pipeline.guards.replay(Duration::from_secs(ttl));
        }
        if let Some(ttl) = parse::<u64>(&read, "WEBHOOK_IDEMPOTENCY_TTL_SECS")? {
            pipeline.guards = pipeline.guards.idempotency(Duration::from_secs(ttl));
        }
        if let Some(ttl) = parse::<u64>(&read, "WEBHOOK_LOCK_TTL_SECS")? {
            pipeline.lock = pipeline.lock.ttl(Duration::from_secs(ttl));
        }
        if let Some(wait) = parse::<u64>(&read, "WEBHOOK_LOCK_WAIT_MS")? {
            pipeline.lock = pipeline.lock.wait(Duration::from_millis(wait));
        }
        if let Some(deadline) = parse::<u64>(&read, "WEBHOOK_DEADLINE_MS")? {
            pipeline.deadline = Duration::from_millis(deadline);
        }
        if let Some(policy) = parse::<DispatchFailurePolicy>(&read, "WEBHOOK_DISPATCH_FAILURE_POLICY")? {
            pipeline.dispatch_failure_policy = policy;
        }

        pipeline.validate()?;
        Ok(Self { secrets, pipeline })
    }
}

fn parse<T: FromStr>(read: &impl Fn(&str) -> Option<String>, key: &str) -> WebhookResult<Option<T>> {
    match read(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| WebhookError::Config(format!("invalid {}: {}", key, raw))),
    }
}
