//! Webhook client for receiving webhooks sent by this system.

use std::sync::Arc;

use hookgate_webhooks::{Clock, SystemClock, WebhookError, WebhookResult, headers, verify_signature_at};

use crate::builder::{OutboundEvent, delivery_headers};
use crate::traits::WebhookExtractor;

/// Client for verifying deliveries on the integrator's side.
pub struct WebhookClient {
    secret: String,
    tolerance_secs: i64,
    clock: Arc<dyn Clock>,
}

impl WebhookClient {
    /// Creates a new webhook client.
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_tolerance(secret, 300)
    }

    /// Creates a client with custom tolerance.
    pub fn with_tolerance(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn tolerance_secs(&self) -> i64 {
        self.tolerance_secs
    }

    /// Verifies a delivery's signature and freshness.
    pub fn verify(&self, timestamp: &str, body: &[u8], signature: &str) -> WebhookResult<()> {
        verify_signature_at(
            self.clock.as_ref(),
            &self.secret,
            timestamp,
            body,
            signature,
            self.tolerance_secs,
        )
    }

    /// Verifies a delivery and parses its body.
    pub fn verify_event(&self, timestamp: &str, body: &[u8], signature: &str) -> WebhookResult<OutboundEvent> {
        self.verify(timestamp, body, signature)?;
        Ok(serde_json::from_slice(body)?)
    }
}

/// Builder for webhook clients.
pub struct WebhookClientBuilder {
    secret: String,
    tolerance_secs: i64,
    clock: Option<Arc<dyn Clock>>,
}

impl WebhookClientBuilder {
    /// Creates a new builder.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: 300,
            clock: None,
        }
    }

    /// Sets the timestamp tolerance.
    pub fn tolerance(mut self, secs: i64) -> Self {
        self.tolerance_secs = secs;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the client.
    pub fn build(self) -> WebhookClient {
        let mut client = WebhookClient::with_tolerance(self.secret, self.tolerance_secs);
        if let Some(clock) = self.clock {
            client.clock = clock;
        }
        client
    }
}

/// Convenience function for verifying deliveries from extractors.
pub fn verify_webhook<E: WebhookExtractor>(client: &WebhookClient, extractor: &E) -> WebhookResult<OutboundEvent> {
    let timestamp = extractor
        .header(delivery_headers::TIMESTAMP)
        .ok_or(WebhookError::MissingHeader(headers::TIMESTAMP))?;
    let signature = extractor
        .header(delivery_headers::SIGNATURE)
        .ok_or(WebhookError::MissingHeader(headers::SIGNATURE))?;
    client.verify_event(timestamp, extractor.body(), signature)
}
