//! # Hookgate Axum Integration
//!
//! Mounts the inbound webhook endpoint on an Axum router:
//! - Raw body capture, so signatures are checked over the exact bytes received
//! - Header mapping into an [`InboundRequest`]
//! - Rendering of [`PipelineResponse`] as JSON
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hookgate_axum::webhook_routes;
//!
//! let app = Router::new().merge(webhook_routes(pipeline, secrets));
//! // POST /webhooks/stripe
//! ```

mod extractor;
mod routes;

pub use extractor::{InboundWebhook, InboundWebhookRejection};
pub use routes::{WebhookSecrets, webhook_routes};

use http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hookgate_webhooks::{InboundRequest, PipelineResponse, WebhookError, headers};

/// Converts the pieces of an Axum request into an [`InboundRequest`].
///
/// Only the path of `uri` is kept; it is what V2 signatures bind to.
pub fn to_inbound_request(method: &Method, uri: &Uri, header_map: &HeaderMap, body: impl Into<Vec<u8>>) -> InboundRequest {
    let mut request = InboundRequest::new(method.as_str(), uri.path(), body);

    for name in [
        headers::SIGNATURE,
        headers::TIMESTAMP,
        headers::IDEMPOTENCY_KEY,
        headers::CONTENT_TYPE,
    ] {
        if let Some(value) = header_map.get(name).and_then(|v| v.to_str().ok()) {
            request = request.header(name, value);
        }
    }

    request
}

/// Converts a pipeline response to an Axum response.
pub fn to_axum_response(response: PipelineResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(response.body)).into_response()
}

/// Wrapper for WebhookError that implements IntoResponse.
pub struct WebhookErrorResponse(pub WebhookError);

impl IntoResponse for WebhookErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "ok": false,
            "error": self.0.to_string(),
            "code": self.0.code()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<WebhookError> for WebhookErrorResponse {
    fn from(err: WebhookError) -> Self {
        WebhookErrorResponse(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_to_inbound_request_maps_known_headers() {
        let mut header_map = HeaderMap::new();
        header_map.insert("X-Webhook-Signature", HeaderValue::from_static("sha256=abc"));
        header_map.insert("x-webhook-timestamp", HeaderValue::from_static("1700000000"));
        header_map.insert("Idempotency-Key", HeaderValue::from_static("evt-1"));
        header_map.insert("content-type", HeaderValue::from_static("application/json"));
        header_map.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));

        let uri: Uri = "/webhooks/stripe?attempt=2".parse().unwrap();
        let request = to_inbound_request(&Method::POST, &uri, &header_map, b"{}".to_vec());

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/webhooks/stripe");
        assert_eq!(request.signature.as_deref(), Some("sha256=abc"));
        assert_eq!(request.timestamp.as_deref(), Some("1700000000"));
        assert_eq!(request.idempotency_key.as_deref(), Some("evt-1"));
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
        assert_eq!(request.body, b"{}");
    }

    #[test]
    fn test_error_response_status() {
        let response = WebhookErrorResponse(WebhookError::SignatureInvalid).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = WebhookErrorResponse(WebhookError::LockUnavailable("org:1".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
