//! Route mounting for the inbound webhook endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use hookgate_webhooks::{Clock, SecretSet, SystemClock, WebhookPipeline};
use tokio::sync::RwLock;

use crate::extractor::InboundWebhook;
use crate::to_axum_response;

/// Secret sets keyed by provider.
///
/// Expired rotation secrets are promoted on lookup, so a deployment that
/// never restarts still stops trusting the old secret once the window ends.
#[derive(Clone)]
pub struct WebhookSecrets {
    providers: Arc<RwLock<HashMap<String, SecretSet>>>,
    clock: Arc<dyn Clock>,
}

impl Default for WebhookSecrets {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSecrets {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Registers `secrets` for `provider`.
    pub fn provider(self, provider: impl Into<String>, secrets: SecretSet) -> Self {
        // Not shared yet, so the lock is uncontended.
        if let Ok(mut providers) = self.providers.try_write() {
            providers.insert(provider.into(), secrets);
        }
        self
    }

    /// Replaces the secrets for `provider` at runtime.
    pub async fn rotate(&self, provider: impl Into<String>, secrets: SecretSet) {
        let provider = provider.into();
        tracing::info!(provider = %provider, "webhook secrets replaced");
        self.providers.write().await.insert(provider, secrets);
    }

    /// Returns the secrets for `provider`, promoting an expired rotation first.
    pub async fn get(&self, provider: &str) -> Option<SecretSet> {
        let now = self.clock.now();
        {
            let providers = self.providers.read().await;
            let secrets = providers.get(provider)?;
            if !secrets.needs_promotion(now) {
                return Some(secrets.clone());
            }
        }

        let mut providers = self.providers.write().await;
        let secrets = providers.get_mut(provider)?;
        if let Some(promoted) = secrets.promote_expired(now) {
            tracing::info!(provider = %provider, "rotation secret promoted to current");
            *secrets = promoted;
        }
        Some(secrets.clone())
    }
}

/// Shared state for webhook routes.
#[derive(Clone)]
struct WebhookState {
    pipeline: Arc<WebhookPipeline>,
    secrets: WebhookSecrets,
}

/// Creates an Axum router serving `POST /webhooks/{provider}`.
///
/// # Example
///
/// ```rust,ignore
/// let secrets = WebhookSecrets::new().provider("stripe", SecretSet::new(secret));
/// let app = Router::new().merge(webhook_routes(pipeline, secrets));
/// ```
pub fn webhook_routes<S>(pipeline: Arc<WebhookPipeline>, secrets: WebhookSecrets) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/webhooks/{provider}", post(receive_handler))
        .with_state(WebhookState { pipeline, secrets })
}

async fn receive_handler(
    State(state): State<WebhookState>,
    Path(provider): Path<String>,
    InboundWebhook(request): InboundWebhook,
) -> Response {
    let Some(secrets) = state.secrets.get(&provider).await else {
        tracing::debug!(provider = %provider, "webhook for unknown provider");
        let body = serde_json::json!({
            "ok": false,
            "error": "unknown webhook provider",
            "code": "unknown_provider"
        });
        return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
    };

    to_axum_response(state.pipeline.handle(&provider, request, &secrets).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookgate_webhooks::FixedClock;

    #[tokio::test]
    async fn test_expired_rotation_is_promoted_on_lookup() {
        let clock = FixedClock::at_secs(1_700_000_000);
        let expires_at = clock.now() + chrono::Duration::seconds(60);
        let secrets = WebhookSecrets::with_clock(Arc::new(clock.clone()))
            .provider("stripe", SecretSet::new("old").with_next("new", expires_at));

        let before = secrets.get("stripe").await.unwrap();
        assert_eq!(before.current(), "old");
        assert!(before.next_expires_at().is_some());

        clock.set(expires_at);
        let after = secrets.get("stripe").await.unwrap();
        assert_eq!(after.current(), "new");
        assert!(after.next_expires_at().is_none());

        assert!(secrets.get("github").await.is_none());
    }

    #[tokio::test]
    async fn test_rotate_replaces_provider_secrets() {
        let secrets = WebhookSecrets::new().provider("stripe", SecretSet::new("one"));
        secrets.rotate("stripe", SecretSet::new("two")).await;
        assert_eq!(secrets.get("stripe").await.unwrap().current(), "two");
    }
}
