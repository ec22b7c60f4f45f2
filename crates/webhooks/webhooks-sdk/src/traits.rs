//! Traits for framework integration.

/// Gives [`crate::verify_webhook`] access to a delivery's headers and raw body.
///
/// Implement this for the request type of whatever HTTP framework receives
/// the delivery. The body must be the exact bytes that arrived on the wire.
pub trait WebhookExtractor {
    /// Looks up a header by name, case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;

    /// Raw body bytes.
    fn body(&self) -> &[u8];
}
