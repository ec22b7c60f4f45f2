//! Outbound delivery signing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use hookgate_webhooks::{Clock, SignedMessage, SystemClock, WebhookResult, WebhookSigner};

/// Header names on deliveries this system sends.
pub mod delivery_headers {
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const TIMESTAMP: &str = "X-Webhook-Timestamp";
    pub const SIGNATURE: &str = "X-Webhook-Signature";
    pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
}

/// Body of an outbound delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub id: String,
    pub topic: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Overrides the default `{topic}:{id}` idempotency key.
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

fn default_version() -> String {
    "1".to_string()
}

impl OutboundEvent {
    /// Creates an event with a fresh id.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            version: default_version(),
            aggregate_type: None,
            aggregate_id: None,
            payload,
            created_at: Utc::now(),
            idempotency_key: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn aggregate(mut self, aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// The key receivers use to collapse redeliveries.
    pub fn effective_idempotency_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.topic, self.id))
    }
}

/// A serialized, signed delivery ready to POST.
#[derive(Debug, Clone)]
pub struct SignedDelivery {
    /// Exact bytes the signature covers.
    pub body: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
}

impl SignedDelivery {
    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Signs deliveries with `HMAC-SHA256(secret, "{timestamp}.{body}")`.
pub struct DeliverySigner {
    signer: WebhookSigner,
    clock: Arc<dyn Clock>,
}

impl DeliverySigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_clock(secret, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            signer: WebhookSigner::new(secret),
            clock,
        }
    }

    /// Serializes `event` and signs it at the current time.
    pub fn sign(&self, event: &OutboundEvent) -> WebhookResult<SignedDelivery> {
        let body = serde_json::to_vec(event)?;
        let timestamp = self.clock.now_secs().to_string();
        let signature = self.signer.sign(&SignedMessage::new(&timestamp, &body))?;

        Ok(SignedDelivery {
            headers: vec![
                (delivery_headers::CONTENT_TYPE, "application/json".to_string()),
                (delivery_headers::TIMESTAMP, timestamp),
                (delivery_headers::SIGNATURE, signature),
                (delivery_headers::IDEMPOTENCY_KEY, event.effective_idempotency_key()),
            ],
            body,
        })
    }
}
