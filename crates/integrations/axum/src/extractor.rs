//! Raw-body extractor for webhook handlers.

use axum::body::Bytes;
use axum::extract::{FromRequest, OriginalUri, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hookgate_webhooks::InboundRequest;

use crate::to_inbound_request;

/// Extractor that captures a webhook delivery without touching its body.
///
/// The path is taken from [`OriginalUri`] when present, so a router nested
/// under a prefix still verifies against the path the sender signed.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(InboundWebhook(request): InboundWebhook) -> StatusCode {
///     match receiver.verify(&secrets, &request) {
///         Ok(_) => StatusCode::OK,
///         Err(_) => StatusCode::UNAUTHORIZED,
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct InboundWebhook(pub InboundRequest);

/// Error returned when the body cannot be read.
#[derive(Debug)]
pub struct InboundWebhookRejection {
    status: StatusCode,
    message: String,
}

impl IntoResponse for InboundWebhookRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "ok": false,
            "error": self.message,
            "code": "invalid_payload"
        });
        (self.status, axum::Json(body)).into_response()
    }
}

impl<S> FromRequest<S> for InboundWebhook
where
    S: Send + Sync,
{
    type Rejection = InboundWebhookRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let method = req.method().clone();
        let uri = req
            .extensions()
            .get::<OriginalUri>()
            .map(|original| original.0.clone())
            .unwrap_or_else(|| req.uri().clone());
        let headers = req.headers().clone();

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| InboundWebhookRejection {
                status: rejection.status(),
                message: rejection.body_text(),
            })?;

        Ok(InboundWebhook(to_inbound_request(&method, &uri, &headers, body.to_vec())))
    }
}
