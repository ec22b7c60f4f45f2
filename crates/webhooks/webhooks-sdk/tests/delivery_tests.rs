use hookgate_webhooks_sdk::{
    DeliverySigner, OutboundEvent, SignedDelivery, WebhookClient, WebhookError, WebhookExtractor, delivery_headers,
    verify_signature, verify_webhook,
};
use serde_json::json;

/// Stand-in for a framework request on the integrator's side.
struct ReceivedRequest {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl From<SignedDelivery> for ReceivedRequest {
    fn from(delivery: SignedDelivery) -> Self {
        Self {
            headers: delivery
                .headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect(),
            body: delivery.body,
        }
    }
}

impl WebhookExtractor for ReceivedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

#[test]
fn test_delivery_verifies_with_standalone_helper() {
    let delivery = DeliverySigner::new("whsec_shared")
        .sign(&OutboundEvent::new("subscription.activated", json!({"org_id": "org_1"})))
        .unwrap();

    let timestamp = delivery.header(delivery_headers::TIMESTAMP).unwrap();
    let signature = delivery.header(delivery_headers::SIGNATURE).unwrap();
    assert!(verify_signature("whsec_shared", timestamp, &delivery.body, signature, 300).is_ok());

    let mut tampered = delivery.body.clone();
    tampered.push(b' ');
    assert!(matches!(
        verify_signature("whsec_shared", timestamp, &tampered, signature, 300),
        Err(WebhookError::SignatureInvalid)
    ));
}

#[test]
fn test_integrator_receives_event() {
    let event = OutboundEvent::new("load.delivered", json!({"load_id": "L-42"}))
        .id("evt_42")
        .aggregate("load", "L-42");
    let request = ReceivedRequest::from(DeliverySigner::new("whsec_shared").sign(&event).unwrap());

    let received = verify_webhook(&WebhookClient::new("whsec_shared"), &request).unwrap();
    assert_eq!(received.id, "evt_42");
    assert_eq!(received.aggregate_id.as_deref(), Some("L-42"));
    assert_eq!(request.header("idempotency-key"), Some("load.delivered:evt_42"));
}

#[test]
fn test_missing_signature_header() {
    let mut request =
        ReceivedRequest::from(DeliverySigner::new("whsec_shared").sign(&OutboundEvent::new("a.b", json!({}))).unwrap());
    request.headers.retain(|(name, _)| name != "x-webhook-signature");

    assert!(matches!(
        verify_webhook(&WebhookClient::new("whsec_shared"), &request),
        Err(WebhookError::MissingHeader(_))
    ));
}
