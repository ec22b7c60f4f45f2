//! Pipeline orchestrator.
//!
//! Runs one inbound request through
//! `verifying -> deduping -> locking -> dispatching -> finalizing -> done`
//! and renders the response contract:
//!
//! | Outcome | Status | Body |
//! |---------|--------|------|
//! | processed | 200 | `{"ok":true}` |
//! | duplicate | 200 | `{"ok":true,"deduped":true}` |
//! | verification failure | 400 / 401 | `{"ok":false,"error":..,"code":..}` |
//! | replay / idempotency collision | 409 | same |
//! | lock contention | 503 | same |
//! | dispatch failure | 202 or 500, see [`DispatchFailurePolicy`] | |
//! | ledger failure | 500 | same |

use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::Dispatcher;
use crate::envelope::{EventExtractor, JsonEnvelopeExtractor};
use crate::error::{WebhookError, WebhookResult};
use crate::guard::{GuardConfig, IdempotencyKey, RequestGuards};
use crate::ledger::{EventLedger, LedgerEntry, LedgerStatus, RecordOutcome};
use crate::lock::{LockConfig, ScopeKey, ScopeLock};
use crate::receiver::{InboundRequest, VerifyOptions, WebhookReceiver};
use crate::reconcile::Reconciler;
use crate::signature::SecretSet;
use crate::store::{LedgerStore, MemoryLedgerStore, MemorySharedStore, SharedStore};

/// Stage a request is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Verifying,
    Deduping,
    Locking,
    Dispatching,
    Finalizing,
    Done,
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Dispatched and processed.
    AcceptedNew,
    /// Short-circuited without dispatch.
    AcceptedDuplicate,
    /// Refused before reaching the ledger.
    Rejected,
    /// Ledger, lock or dispatch failure.
    Error,
}

/// Response to a dispatch failure that was recorded on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchFailurePolicy {
    /// `202 {"ok":false,"recorded":true}`. The sender stops retrying and the
    /// errored row waits for reconciliation.
    #[default]
    Acknowledge,
    /// `500`, inviting the sender to retry.
    Retry,
}

impl FromStr for DispatchFailurePolicy {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acknowledge" | "ack" | "202" => Ok(Self::Acknowledge),
            "retry" | "500" => Ok(Self::Retry),
            other => Err(WebhookError::Config(format!("unknown dispatch failure policy: {}", other))),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub verify: VerifyOptions,
    pub guards: GuardConfig,
    pub lock: LockConfig,
    /// Overall budget for locking and dispatch.
    pub deadline: Duration,
    pub dispatch_failure_policy: DispatchFailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verify: VerifyOptions::default(),
            guards: GuardConfig::default(),
            lock: LockConfig::default(),
            deadline: Duration::from_secs(10),
            dispatch_failure_policy: DispatchFailurePolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the verification options.
    pub fn verify(mut self, verify: VerifyOptions) -> Self {
        self.verify = verify;
        self
    }

    /// Sets the replay and idempotency guard configuration.
    pub fn guards(mut self, guards: GuardConfig) -> Self {
        self.guards = guards;
        self
    }

    /// Sets the scope lock timing.
    pub fn lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the overall budget for locking and dispatch.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the answer to a recorded dispatch failure.
    pub fn dispatch_failure_policy(mut self, policy: DispatchFailurePolicy) -> Self {
        self.dispatch_failure_policy = policy;
        self
    }

    /// Checks that the settings can hold the pipeline's guarantees.
    ///
    /// The scope lock must outlive the deadline, or a slow dispatch could
    /// lose exclusivity while it still runs.
    pub fn validate(&self) -> WebhookResult<()> {
        if self.verify.max_skew_secs < 0 {
            return Err(WebhookError::Config(format!(
                "max skew must not be negative: {}",
                self.verify.max_skew_secs
            )));
        }
        if self.lock.ttl <= self.deadline {
            return Err(WebhookError::Config(format!(
                "lock TTL {:?} must exceed the deadline {:?}",
                self.lock.ttl, self.deadline
            )));
        }
        if self.lock.poll_interval.is_zero() {
            return Err(WebhookError::Config("lock poll interval must be positive".into()));
        }
        Ok(())
    }
}

/// What the transport should answer.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResponse {
    pub status: u16,
    pub body: Value,
    pub outcome: PipelineOutcome,
    /// Ledger row the request resolved to, if it got that far.
    pub ledger_id: Option<Uuid>,
}

impl PipelineResponse {
    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

enum Accepted {
    New,
    Duplicate,
}

enum Dispatched {
    Applied,
    AlreadyClaimed,
    Failed(String),
    TimedOut,
}

/// Progress of one request, for logging and the response.
struct Run {
    state: PipelineState,
    ledger_id: Option<Uuid>,
}

impl Run {
    fn enter(&mut self, state: PipelineState) {
        tracing::debug!(from = ?self.state, to = ?state, "Pipeline transition");
        self.state = state;
    }
}

/// Treats anything a ledger call fails with as a ledger failure.
fn ledger_failure(err: WebhookError) -> WebhookError {
    match err {
        WebhookError::LedgerWriteFailure(_) => err,
        other => WebhookError::LedgerWriteFailure(other.to_string()),
    }
}

/// Verified, de-duplicated, scope-locked webhook processing.
pub struct WebhookPipeline {
    config: PipelineConfig,
    receiver: WebhookReceiver,
    guards: RequestGuards,
    ledger: EventLedger,
    lock: ScopeLock,
    dispatcher: Arc<dyn Dispatcher>,
    extractor: Arc<dyn EventExtractor>,
}

impl fmt::Debug for WebhookPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookPipeline").field("config", &self.config).finish()
    }
}

impl WebhookPipeline {
    /// Starts building a pipeline around `dispatcher`.
    pub fn builder(dispatcher: Arc<dyn Dispatcher>) -> WebhookPipelineBuilder {
        WebhookPipelineBuilder::new(dispatcher)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    /// Reconciliation over this pipeline's ledger.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.ledger.clone())
    }

    /// Processes one inbound request from `provider`.
    ///
    /// Never fails: every error is rendered into the response.
    pub async fn handle(&self, provider: &str, request: InboundRequest, secrets: &SecretSet) -> PipelineResponse {
        let span = tracing::info_span!(
            "webhook_pipeline",
            provider = %provider,
            event_id = tracing::field::Empty
        );
        self.run(provider, &request, secrets).instrument(span).await
    }

    async fn run(&self, provider: &str, request: &InboundRequest, secrets: &SecretSet) -> PipelineResponse {
        let started = Instant::now();
        let mut run = Run {
            state: PipelineState::Verifying,
            ledger_id: None,
        };

        let result = self.process(provider, request, secrets, started, &mut run).await;
        run.enter(PipelineState::Done);

        match result {
            Ok(Accepted::New) => PipelineResponse {
                status: 200,
                body: json!({"ok": true}),
                outcome: PipelineOutcome::AcceptedNew,
                ledger_id: run.ledger_id,
            },
            Ok(Accepted::Duplicate) => PipelineResponse {
                status: 200,
                body: json!({"ok": true, "deduped": true}),
                outcome: PipelineOutcome::AcceptedDuplicate,
                ledger_id: run.ledger_id,
            },
            Err(err) => self.error_response(err, run.ledger_id),
        }
    }

    async fn process(
        &self,
        provider: &str,
        request: &InboundRequest,
        secrets: &SecretSet,
        started: Instant,
        run: &mut Run,
    ) -> WebhookResult<Accepted> {
        let verified = self.receiver.verify(secrets, request)?;

        run.enter(PipelineState::Deduping);
        let idempotency_key = request
            .idempotency_key
            .as_deref()
            .map(IdempotencyKey::parse)
            .transpose()?;
        let admission = self.guards.admit(&verified, idempotency_key.as_ref()).await?;

        let result = self.record_and_dispatch(provider, request, started, run).await;
        if result.is_err() {
            self.guards.revoke(admission).await;
        }
        result
    }

    async fn record_and_dispatch(
        &self,
        provider: &str,
        request: &InboundRequest,
        started: Instant,
        run: &mut Run,
    ) -> WebhookResult<Accepted> {
        let event = self.extractor.extract(&request.body)?;
        tracing::Span::current().record("event_id", event.event_id.as_str());

        let recorded = self
            .ledger
            .record_received(provider, &event.event_id, &event.event_type, event.payload, event.org_scope)
            .await?;
        run.ledger_id = Some(recorded.id());

        let entry = match recorded {
            RecordOutcome::New(entry) => entry,
            RecordOutcome::Duplicate(entry) if entry.status == LedgerStatus::Received => {
                tracing::info!(ledger_id = %entry.id, "Resuming unprocessed event");
                entry
            }
            RecordOutcome::Duplicate(entry) => {
                tracing::info!(ledger_id = %entry.id, status = %entry.status, "Duplicate delivery absorbed");
                return Ok(Accepted::Duplicate);
            }
        };

        run.enter(PipelineState::Locking);
        let deadline = started + self.config.deadline;
        let scope = ScopeKey::for_event(provider, entry.org_scope.as_deref(), &entry.event_id);
        let wait = self
            .config
            .lock
            .wait
            .min(deadline.saturating_duration_since(Instant::now()));
        let lock = self.lock.acquire_within(&scope, wait).await.inspect_err(|_| {
            tracing::warn!(scope = %scope, ledger_id = %entry.id, "Scope lock contended");
        })?;

        run.enter(PipelineState::Dispatching);
        let dispatched = self.dispatch(&entry, deadline).await;

        run.enter(PipelineState::Finalizing);
        let finalized = match dispatched {
            Ok(dispatched) => self.finalize(&entry, dispatched).await,
            Err(e) => Err(e),
        };
        if let Err(e) = lock.release().await {
            tracing::warn!(scope = %scope, error = %e, "Failed to release scope lock");
        }
        finalized
    }

    async fn dispatch(&self, entry: &LedgerEntry, deadline: Instant) -> WebhookResult<Dispatched> {
        // Another delivery may have claimed the row between recording and locking
        if !self.ledger.claim(entry.id).await.map_err(ledger_failure)? {
            return Ok(Dispatched::AlreadyClaimed);
        }

        let apply = self
            .dispatcher
            .apply(&entry.event_type, &entry.payload, entry.org_scope.as_deref());
        match tokio::time::timeout_at(deadline, apply).await {
            Ok(Ok(())) => Ok(Dispatched::Applied),
            Ok(Err(e)) => Ok(Dispatched::Failed(e.message)),
            Err(_) => Ok(Dispatched::TimedOut),
        }
    }

    async fn finalize(&self, entry: &LedgerEntry, dispatched: Dispatched) -> WebhookResult<Accepted> {
        let ledger_id = entry.id.to_string();
        match dispatched {
            Dispatched::Applied => {
                self.ledger.mark_processed(entry.id).await.map_err(ledger_failure)?;
                tracing::info!(ledger_id = %entry.id, event_type = %entry.event_type, "Webhook event processed");
                Ok(Accepted::New)
            }
            Dispatched::AlreadyClaimed => {
                tracing::info!(ledger_id = %entry.id, "Event claimed by another delivery");
                Ok(Accepted::Duplicate)
            }
            Dispatched::Failed(message) => {
                self.ledger
                    .mark_errored(entry.id, message.as_str())
                    .await
                    .map_err(ledger_failure)?;
                tracing::error!(
                    ledger_id = %entry.id,
                    event_type = %entry.event_type,
                    error = %message,
                    "Webhook dispatch failed"
                );
                Err(WebhookError::DispatchFailure { ledger_id, message })
            }
            Dispatched::TimedOut => {
                self.ledger
                    .mark_errored(entry.id, "deadline exceeded")
                    .await
                    .map_err(ledger_failure)?;
                tracing::error!(ledger_id = %entry.id, event_type = %entry.event_type, "Webhook dispatch timed out");
                Err(WebhookError::DeadlineExceeded { ledger_id })
            }
        }
    }

    fn error_response(&self, err: WebhookError, ledger_id: Option<Uuid>) -> PipelineResponse {
        if err.is_recorded_failure() {
            return match self.config.dispatch_failure_policy {
                DispatchFailurePolicy::Acknowledge => PipelineResponse {
                    status: 202,
                    body: json!({"ok": false, "recorded": true}),
                    outcome: PipelineOutcome::Error,
                    ledger_id,
                },
                DispatchFailurePolicy::Retry => PipelineResponse {
                    status: 500,
                    body: json!({"ok": false, "error": err.to_string(), "code": err.code()}),
                    outcome: PipelineOutcome::Error,
                    ledger_id,
                },
            };
        }

        let outcome = if err.is_client_error() {
            PipelineOutcome::Rejected
        } else {
            if err.status_code() >= 500 && !matches!(err, WebhookError::LockUnavailable(_)) {
                tracing::error!(error = %err, "Webhook pipeline failed");
            }
            PipelineOutcome::Error
        };

        PipelineResponse {
            status: err.status_code(),
            body: json!({"ok": false, "error": err.to_string(), "code": err.code()}),
            outcome,
            ledger_id,
        }
    }
}

/// Builder for [`WebhookPipeline`].
///
/// Stores default to the in-memory backends, which only protect a single
/// process.
pub struct WebhookPipelineBuilder {
    dispatcher: Arc<dyn Dispatcher>,
    config: PipelineConfig,
    shared_store: Option<Arc<dyn SharedStore>>,
    ledger_store: Option<Arc<dyn LedgerStore>>,
    extractor: Option<Arc<dyn EventExtractor>>,
    clock: Option<Arc<dyn Clock>>,
}

impl WebhookPipelineBuilder {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            config: PipelineConfig::default(),
            shared_store: None,
            ledger_store: None,
            extractor: None,
            clock: None,
        }
    }

    /// Sets the pipeline configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Store for guards and scope locks.
    pub fn shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    /// Store for the event ledger.
    pub fn ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    /// Parses verified bodies into events.
    pub fn extractor(mut self, extractor: Arc<dyn EventExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Time source for verification, ledger timestamps and lock expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the pipeline.
    ///
    /// A lock TTL that does not exceed the deadline is raised to one second
    /// past it.
    pub fn build(mut self) -> WebhookPipeline {
        if self.config.lock.ttl <= self.config.deadline {
            let ttl = self.config.deadline + Duration::from_secs(1);
            tracing::warn!(
                configured = ?self.config.lock.ttl,
                deadline = ?self.config.deadline,
                raised_to = ?ttl,
                "Scope lock TTL raised above the pipeline deadline"
            );
            self.config.lock.ttl = ttl;
        }
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let shared_store = self
            .shared_store
            .unwrap_or_else(|| Arc::new(MemorySharedStore::with_clock(clock.clone())));
        let ledger_store = self
            .ledger_store
            .unwrap_or_else(|| Arc::new(MemoryLedgerStore::new()));

        WebhookPipeline {
            receiver: WebhookReceiver::with_clock(self.config.verify.clone(), clock.clone()),
            guards: RequestGuards::new(shared_store.clone(), &self.config.guards),
            ledger: EventLedger::new(ledger_store, clock.clone()),
            lock: ScopeLock::new(shared_store, clock, self.config.lock.clone()),
            dispatcher: self.dispatcher,
            extractor: self
                .extractor
                .unwrap_or_else(|| Arc::new(JsonEnvelopeExtractor::default())),
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for Counting {
        async fn apply(&self, _: &str, _: &Value, _: Option<&str>) -> Result<(), DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Dispatcher for Failing {
        async fn apply(&self, _: &str, _: &Value, _: Option<&str>) -> Result<(), DispatchError> {
            Err(DispatchError::new("downstream unavailable"))
        }
    }

    fn pipeline(dispatcher: Arc<dyn Dispatcher>, config: PipelineConfig) -> WebhookPipeline {
        WebhookPipeline::builder(dispatcher).config(config).build()
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("acknowledge".parse::<DispatchFailurePolicy>().unwrap(), DispatchFailurePolicy::Acknowledge);
        assert_eq!(" RETRY ".parse::<DispatchFailurePolicy>().unwrap(), DispatchFailurePolicy::Retry);
        assert!("sometimes".parse::<DispatchFailurePolicy>().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(PipelineConfig::default().validate().is_ok());

        let short_lock = PipelineConfig::default()
            .deadline(Duration::from_secs(30))
            .lock(LockConfig::default().ttl(Duration::from_secs(30)));
        assert!(matches!(short_lock.validate(), Err(WebhookError::Config(_))));

        let mut negative_skew = PipelineConfig::default();
        negative_skew.verify.max_skew_secs = -1;
        assert!(matches!(negative_skew.validate(), Err(WebhookError::Config(_))));
    }

    #[test]
    fn test_builder_raises_lock_ttl_above_deadline() {
        let config = PipelineConfig::default()
            .deadline(Duration::from_secs(60))
            .lock(LockConfig::default().ttl(Duration::from_secs(5)));
        let pipeline = pipeline(Arc::new(Counting::default()), config);

        assert_eq!(pipeline.config().lock.ttl, Duration::from_secs(61));
        assert!(pipeline.config().validate().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_request_never_reaches_ledger() {
        let dispatcher = Arc::new(Counting::default());
        let pipeline = pipeline(dispatcher.clone(), PipelineConfig::default());

        let request = InboundRequest::new("POST", "/webhooks/stripe", r#"{"id":"evt_1"}"#)
            .content_type("application/json")
            .signature("sha256=00")
            .timestamp(chrono::Utc::now().timestamp().to_string());
        let response = pipeline.handle("stripe", request, &SecretSet::new("s1")).await;

        assert_eq!(response.status, 401);
        assert_eq!(response.outcome, PipelineOutcome::Rejected);
        assert_eq!(response.body["code"], "invalid_signature");
        assert!(response.ledger_id.is_none());
        assert!(pipeline.ledger().find("stripe", "evt_1").await.unwrap().is_none());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_response_mapping() {
        let pipeline = pipeline(Arc::new(Failing), PipelineConfig::default());
        let recorded = WebhookError::DispatchFailure {
            ledger_id: "x".into(),
            message: "boom".into(),
        };

        let response = pipeline.error_response(recorded, None);
        assert_eq!(response.status, 202);
        assert_eq!(response.body, json!({"ok": false, "recorded": true}));

        let response = pipeline.error_response(WebhookError::LockUnavailable("s".into()), None);
        assert_eq!(response.status, 503);
        assert_eq!(response.outcome, PipelineOutcome::Error);

        let response = pipeline.error_response(WebhookError::IdempotencyConflict("k".into()), None);
        assert_eq!(response.status, 409);
        assert_eq!(response.outcome, PipelineOutcome::Rejected);

        let retrying = self::pipeline(
            Arc::new(Failing),
            PipelineConfig::default().dispatch_failure_policy(DispatchFailurePolicy::Retry),
        );
        let response = retrying.error_response(WebhookError::DeadlineExceeded { ledger_id: "x".into() }, None);
        assert_eq!(response.status, 500);
        assert_eq!(response.body["code"], "deadline_exceeded");
    }
}
