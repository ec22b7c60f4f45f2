use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use hookgate_axum::{WebhookSecrets, webhook_routes};
use hookgate_webhooks::{
    DispatchError, Dispatcher, SecretSet, SignatureVersion, SignedMessage, WebhookPipeline, WebhookSigner,
};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &str = "whsec_axum";

#[derive(Default)]
struct CountingDispatcher {
    applied: AtomicUsize,
}

#[async_trait]
impl Dispatcher for CountingDispatcher {
    async fn apply(&self, _event_type: &str, _payload: &Value, _org_scope: Option<&str>) -> Result<(), DispatchError> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn app(dispatcher: Arc<CountingDispatcher>) -> Router {
    let pipeline = Arc::new(WebhookPipeline::builder(dispatcher).build());
    let secrets = WebhookSecrets::new().provider("stripe", SecretSet::new(SECRET));
    webhook_routes(pipeline, secrets)
}

fn signed_request(path: &str, signed_path: &str, body: &[u8], secret: &str) -> Request<Body> {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let signature = WebhookSigner::with_version(secret, SignatureVersion::V2)
        .sign_header(&SignedMessage::new(&timestamp, body).with_request("POST", signed_path))
        .unwrap();

    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-webhook-timestamp", timestamp)
        .header("x-webhook-signature", signature)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn event_body(id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": "checkout.session.completed",
        "data": { "object": { "client_reference_id": "org_1" } }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_delivery_then_redelivery_is_deduped() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let app = app(dispatcher.clone());
    let body = event_body("evt_axum_1");

    let response = app
        .clone()
        .oneshot(signed_request("/webhooks/stripe", "/webhooks/stripe", &body, SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"ok": true}));

    let response = app
        .oneshot(signed_request("/webhooks/stripe", "/webhooks/stripe", &body, SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"ok": true, "deduped": true}));

    assert_eq!(dispatcher.applied.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wrong_secret_is_unauthorized() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let response = app(dispatcher.clone())
        .oneshot(signed_request(
            "/webhooks/stripe",
            "/webhooks/stripe",
            &event_body("evt_axum_2"),
            "whsec_other",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "invalid_signature");
    assert_eq!(dispatcher.applied.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_signature_bound_to_path() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let response = app(dispatcher.clone())
        .oneshot(signed_request(
            "/webhooks/stripe",
            "/webhooks/other",
            &event_body("evt_axum_3"),
            SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(dispatcher.applied.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_nested_router_verifies_full_path() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let app = Router::new().nest("/api", app(dispatcher.clone()));

    let response = app
        .oneshot(signed_request(
            "/api/webhooks/stripe",
            "/api/webhooks/stripe",
            &event_body("evt_axum_4"),
            SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(dispatcher.applied.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let response = app(dispatcher)
        .oneshot(signed_request(
            "/webhooks/github",
            "/webhooks/github",
            &event_body("evt_axum_5"),
            SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "unknown_provider");
}

#[tokio::test]
async fn test_missing_signature_header() {
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("content-type", "application/json")
        .header("x-webhook-timestamp", chrono::Utc::now().timestamp().to_string())
        .body(Body::from(event_body("evt_axum_6")))
        .unwrap();

    let response = app(Arc::new(CountingDispatcher::default())).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
