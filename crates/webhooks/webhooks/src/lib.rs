//! # Hookgate Webhooks
//!
//! Verified, idempotent processing of inbound webhooks:
//! - HMAC signature verification bound to timestamp, method, path and raw body
//! - Freshness window and zero-downtime secret rotation
//! - Replay and idempotency guards over a shared TTL store
//! - Event ledger with an atomic conditional insert and forward-only statuses
//! - Scope locks that serialize deliveries touching the same tenant
//! - A pipeline that dispatches each event at most once
//!
//! ## Example
//!
//! ```rust,ignore
//! use hookgate_webhooks::{InboundRequest, SecretSet, WebhookPipeline, WebhookSettings};
//!
//! let settings = WebhookSettings::from_env()?;
//! let pipeline = WebhookPipeline::builder(Arc::new(BillingDispatcher::new(db)))
//!     .config(settings.pipeline)
//!     .shared_store(Arc::new(RedisSharedStore::new(&redis_url)?))
//!     .ledger_store(Arc::new(RedisLedgerStore::new(&redis_url)?))
//!     .build();
//!
//! let response = pipeline.handle("stripe", request, &settings.secrets).await;
//! ```

mod clock;
mod config;
mod dispatcher;
mod envelope;
mod error;
mod guard;
mod ledger;
mod lock;
mod pipeline;
mod receiver;
mod reconcile;
mod signature;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{WebhookSettings, get_env_with_prefix};
pub use dispatcher::{DispatchError, Dispatcher};
pub use envelope::{EventExtractor, InboundEvent, JsonEnvelopeExtractor};
pub use error::{WebhookError, WebhookResult};
pub use guard::{Admission, GuardConfig, IdempotencyGuard, IdempotencyKey, ReplayGuard, RequestGuards};
pub use ledger::{EventLedger, LedgerEntry, LedgerStatus, RecordKind, RecordOutcome};
pub use lock::{LockConfig, LockGuard, LockToken, ScopeKey, ScopeLock};
pub use pipeline::{
    DispatchFailurePolicy, PipelineConfig, PipelineOutcome, PipelineResponse, PipelineState, WebhookPipeline,
    WebhookPipelineBuilder,
};
pub use receiver::{InboundRequest, VerifiedRequest, VerifyOptions, WebhookReceiver, headers};
pub use reconcile::Reconciler;
pub use signature::{
    SIGNATURE_PREFIX, SecretSet, SecretSlot, SignatureVersion, SignedMessage, WebhookSigner, check_freshness,
    normalize_signature, parse_timestamp, verify_signature, verify_signature_at,
};
pub use store::{LedgerQuery, LedgerStore, MemoryLedgerStore, MemorySharedStore, SharedStore};
