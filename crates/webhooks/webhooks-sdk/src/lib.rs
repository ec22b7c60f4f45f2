//! # Hookgate Webhooks SDK
//!
//! Helpers for the two ends of a webhook exchange with Hookgate:
//! - Sign outbound deliveries with a timestamped HMAC and an idempotency key
//! - Verify those deliveries on the integrator's side
//!
//! ## Example
//!
//! ```rust,ignore
//! use hookgate_webhooks_sdk::{DeliverySigner, OutboundEvent, WebhookClient, verify_webhook};
//!
//! let delivery = DeliverySigner::new(secret)
//!     .sign(&OutboundEvent::new("load.delivered", json!({ "load_id": "L-7" })))?;
//!
//! // on the receiving side
//! let event = verify_webhook(&WebhookClient::new(secret), &request)?;
//! ```

mod builder;
mod client;
mod traits;

pub use builder::{DeliverySigner, OutboundEvent, SignedDelivery, delivery_headers};
pub use client::{WebhookClient, WebhookClientBuilder, verify_webhook};
pub use traits::WebhookExtractor;

// Re-export core signing types for convenience
pub use hookgate_webhooks::{
    SignatureVersion, WebhookError, WebhookResult, WebhookSigner, verify_signature, verify_signature_at,
};
