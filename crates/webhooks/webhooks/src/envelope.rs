//! Reading the event envelope out of a verified body.

use serde_json::Value;

use crate::error::{WebhookError, WebhookResult};

/// Event type recorded when the envelope carries none.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// The parts of an inbound event the ledger and lock need.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_id: String,
    pub event_type: String,
    pub org_scope: Option<String>,
    pub payload: Value,
}

/// Parses a verified request body into an [`InboundEvent`].
///
/// Only called after signature verification succeeded.
pub trait EventExtractor: Send + Sync {
    fn extract(&self, body: &[u8]) -> WebhookResult<InboundEvent>;
}

/// Extracts envelope fields from a JSON body by JSON pointer.
///
/// Defaults follow the common billing-provider shape: `/id`, `/type`, and the
/// tenant at `/data/object/metadata/orgId` or
/// `/data/object/client_reference_id`.
#[derive(Debug, Clone)]
pub struct JsonEnvelopeExtractor {
    id_pointer: String,
    type_pointer: String,
    org_pointers: Vec<String>,
    payload_pointer: Option<String>,
}

impl Default for JsonEnvelopeExtractor {
    fn default() -> Self {
        Self {
            id_pointer: "/id".to_string(),
            type_pointer: "/type".to_string(),
            org_pointers: vec![
                "/data/object/metadata/orgId".to_string(),
                "/data/object/client_reference_id".to_string(),
            ],
            payload_pointer: None,
        }
    }
}

impl JsonEnvelopeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_at(mut self, pointer: impl Into<String>) -> Self {
        self.id_pointer = pointer.into();
        self
    }

    pub fn type_at(mut self, pointer: impl Into<String>) -> Self {
        self.type_pointer = pointer.into();
        self
    }

    /// Replaces the tenant pointers; the first non-empty match wins.
    pub fn org_at<I, S>(mut self, pointers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.org_pointers = pointers.into_iter().map(Into::into).collect();
        self
    }

    /// Stores only the sub-document at `pointer` as the payload.
    pub fn payload_at(mut self, pointer: impl Into<String>) -> Self {
        self.payload_pointer = Some(pointer.into());
        self
    }
}

fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl EventExtractor for JsonEnvelopeExtractor {
    fn extract(&self, body: &[u8]) -> WebhookResult<InboundEvent> {
        let document: Value = serde_json::from_slice(body)?;

        let event_id = scalar(document.pointer(&self.id_pointer))
            .ok_or_else(|| WebhookError::InvalidPayload(format!("no event id at {}", self.id_pointer)))?;
        let event_type =
            scalar(document.pointer(&self.type_pointer)).unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string());
        let org_scope = self
            .org_pointers
            .iter()
            .find_map(|pointer| scalar(document.pointer(pointer)));

        let payload = match &self.payload_pointer {
            Some(pointer) => document
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| WebhookError::InvalidPayload(format!("no payload at {}", pointer)))?,
            None => document,
        };

        Ok(InboundEvent {
            event_id,
            event_type,
            org_scope,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_billing_envelope() {
        let body = json!({
            "id": "evt_1",
            "type": "customer.subscription.created",
            "data": {"object": {"metadata": {"orgId": "org_42"}, "client_reference_id": "org_other"}}
        });
        let event = JsonEnvelopeExtractor::new()
            .extract(body.to_string().as_bytes())
            .unwrap();

        assert_eq!(event.event_id, "evt_1");
        assert_eq!(event.event_type, "customer.subscription.created");
        assert_eq!(event.org_scope.as_deref(), Some("org_42"));
        assert_eq!(event.payload, body);
    }

    #[test]
    fn test_org_falls_back_to_client_reference() {
        let body = json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "org_7"}}
        });
        let event = JsonEnvelopeExtractor::new()
            .extract(body.to_string().as_bytes())
            .unwrap();
        assert_eq!(event.org_scope.as_deref(), Some("org_7"));
    }

    #[test]
    fn test_missing_id_is_invalid_payload() {
        let err = JsonEnvelopeExtractor::new()
            .extract(br#"{"type":"invoice.paid"}"#)
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidPayload(_)));

        let err = JsonEnvelopeExtractor::new().extract(b"not json").unwrap_err();
        assert!(matches!(err, WebhookError::InvalidPayload(_)));
    }

    #[test]
    fn test_custom_pointers() {
        let body = json!({"event": {"uuid": 991, "topic": "load.updated", "tenant": "org_3"}, "data": {"x": 1}});
        let event = JsonEnvelopeExtractor::new()
            .id_at("/event/uuid")
            .type_at("/event/topic")
            .org_at(["/event/tenant"])
            .payload_at("/data")
            .extract(body.to_string().as_bytes())
            .unwrap();

        assert_eq!(event.event_id, "991");
        assert_eq!(event.event_type, "load.updated");
        assert_eq!(event.org_scope.as_deref(), Some("org_3"));
        assert_eq!(event.payload, json!({"x": 1}));
    }
}
