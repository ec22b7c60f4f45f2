//! Verification of inbound webhook requests.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::{WebhookError, WebhookResult};
use crate::signature::{
    SecretSet, SecretSlot, SignatureVersion, SignedMessage, check_freshness, normalize_signature,
    parse_timestamp, signed_forms,
};

/// Header names of the inbound endpoint contract.
pub mod headers {
    /// Hex HMAC of the request, optionally prefixed with `sha256=`.
    pub const SIGNATURE: &str = "x-webhook-signature";
    /// Epoch seconds or ISO-8601.
    pub const TIMESTAMP: &str = "x-webhook-timestamp";
    /// Optional caller-supplied idempotency token.
    pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
    pub const CONTENT_TYPE: &str = "content-type";
}

/// An inbound request as captured by the transport, body untouched.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub idempotency_key: Option<String>,
    /// Exact bytes received.
    pub body: Vec<u8>,
}

impl InboundRequest {
    /// Captures a request with no headers set.
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Sets the `Content-Type` header value.
    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    /// Sets the signature header value.
    pub fn signature(mut self, value: impl Into<String>) -> Self {
        self.signature = Some(value.into());
        self
    }

    /// Sets the timestamp header value.
    pub fn timestamp(mut self, value: impl Into<String>) -> Self {
        self.timestamp = Some(value.into());
        self
    }

    /// Sets the idempotency key header value.
    pub fn idempotency_key(mut self, value: impl Into<String>) -> Self {
        self.idempotency_key = Some(value.into());
        self
    }

    /// Fills a field from a header by name, case-insensitively.
    ///
    /// Unknown headers are ignored.
    pub fn header(self, name: &str, value: impl Into<String>) -> Self {
        match name.to_ascii_lowercase().as_str() {
            headers::SIGNATURE => self.signature(value),
            headers::TIMESTAMP => self.timestamp(value),
            headers::IDEMPOTENCY_KEY => self.idempotency_key(value),
            headers::CONTENT_TYPE => self.content_type(value),
            _ => self,
        }
    }
}

/// Verification settings.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Largest accepted distance between the request timestamp and now.
    pub max_skew_secs: i64,
    /// Accepted media types, compared without parameters.
    pub allowed_content_types: Vec<String>,
    /// Names the verified surface in logs.
    pub label: String,
    /// What the signature binds.
    pub version: SignatureVersion,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            max_skew_secs: 300,
            allowed_content_types: vec!["application/json".to_string()],
            label: "webhook".to_string(),
            version: SignatureVersion::V2,
        }
    }
}

impl VerifyOptions {
    /// Sets the freshness window in seconds.
    pub fn max_skew_secs(mut self, secs: i64) -> Self {
        self.max_skew_secs = secs;
        self
    }

    /// Replaces the accepted media types.
    pub fn allowed_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_content_types = types.into_iter().map(|t| t.into().to_ascii_lowercase()).collect();
        self
    }

    /// Sets the name used for this surface in logs.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets what the signature binds.
    pub fn version(mut self, version: SignatureVersion) -> Self {
        self.version = version;
        self
    }

    fn allows(&self, content_type: &str) -> bool {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&media_type))
    }
}

/// A request that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRequest {
    /// Lowercase hex digest, without prefix.
    pub signature: String,
    /// Request timestamp in epoch seconds.
    pub timestamp: i64,
    /// Which secret produced the signature.
    pub matched: SecretSlot,
}

/// Verifies authenticity and freshness of inbound requests.
///
/// Verification has no side effects; every rejection is final for the request.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    options: VerifyOptions,
    clock: Arc<dyn Clock>,
}

impl WebhookReceiver {
    /// Creates a receiver on the system clock.
    pub fn new(options: VerifyOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Creates a receiver reading time from `clock`.
    pub fn with_clock(options: VerifyOptions, clock: Arc<dyn Clock>) -> Self {
        Self { options, clock }
    }

    pub fn options(&self) -> &VerifyOptions {
        &self.options
    }

    /// Checks content type, headers, timestamp freshness and the MAC, in
    /// that order.
    pub fn verify(&self, secrets: &SecretSet, request: &InboundRequest) -> WebhookResult<VerifiedRequest> {
        let result = self.check(secrets, request);
        match &result {
            Ok(verified) => {
                if verified.matched == SecretSlot::Next {
                    tracing::debug!(label = %self.options.label, "Signature matched rotation secret");
                }
            }
            Err(e @ WebhookError::SignatureInvalid) => {
                tracing::warn!(label = %self.options.label, reason = e.code(), "Webhook verification failed");
            }
            Err(e) => {
                tracing::debug!(label = %self.options.label, reason = e.code(), "Webhook rejected");
            }
        }
        result
    }

    fn check(&self, secrets: &SecretSet, request: &InboundRequest) -> WebhookResult<VerifiedRequest> {
        let content_type = request.content_type.as_deref().unwrap_or_default();
        if !self.options.allows(content_type) {
            return Err(WebhookError::UnsupportedContentType(content_type.to_string()));
        }

        let signature = request
            .signature
            .as_deref()
            .ok_or(WebhookError::MissingHeader(headers::SIGNATURE))?;
        let raw_timestamp = request
            .timestamp
            .as_deref()
            .ok_or(WebhookError::MissingHeader(headers::TIMESTAMP))?;

        let timestamp = parse_timestamp(raw_timestamp)?;
        let now = self.clock.now();
        check_freshness(timestamp, now.timestamp(), self.options.max_skew_secs)?;

        // Senders may sign the header as sent or its epoch-seconds form
        let epoch = timestamp.to_string();
        let matched = signed_forms(raw_timestamp, &epoch)
            .find_map(|ts| {
                let message = SignedMessage::new(ts, &request.body).with_request(&request.method, &request.path);
                secrets.matching_slot(&message, signature, self.options.version, now)
            })
            .ok_or(WebhookError::SignatureInvalid)?;

        Ok(VerifiedRequest {
            signature: normalize_signature(signature).ok_or(WebhookError::SignatureInvalid)?,
            timestamp,
            matched,
        })
    }
}
