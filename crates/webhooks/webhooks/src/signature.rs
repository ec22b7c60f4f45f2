//! HMAC signature generation and verification.

use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

use crate::clock::{Clock, SystemClock};
use crate::error::{WebhookError, WebhookResult};

type HmacSha256 = Hmac<Sha256>;

/// Prefix some senders put in front of the hex digest.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Signature version for webhook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureVersion {
    /// Version 1: HMAC-SHA256 over `timestamp.body`. Used for deliveries this
    /// system sends.
    #[default]
    V1,
    /// Version 2: HMAC-SHA256 over `timestamp.METHOD.path.body`. Used for
    /// inbound requests so a signature cannot be moved to another route.
    V2,
}

/// The fields a signature covers.
///
/// The body is the exact byte sequence received; it is never re-serialized
/// before the MAC is computed.
#[derive(Debug, Clone, Copy)]
pub struct SignedMessage<'a> {
    /// Timestamp exactly as it appears in the header.
    pub timestamp: &'a str,
    /// HTTP method (V2 only).
    pub method: &'a str,
    /// Request path (V2 only).
    pub path: &'a str,
    /// Raw request body.
    pub body: &'a [u8],
}

impl<'a> SignedMessage<'a> {
    /// Creates a message covering a timestamp and a body.
    pub fn new(timestamp: &'a str, body: &'a [u8]) -> Self {
        Self {
            timestamp,
            method: "",
            path: "",
            body,
        }
    }

    /// Binds the HTTP method and path into the message.
    pub fn with_request(mut self, method: &'a str, path: &'a str) -> Self {
        self.method = method;
        self.path = path;
        self
    }
}

/// Webhook signer for generating and verifying signatures.
pub struct WebhookSigner {
    secret: String,
    version: SignatureVersion,
}

impl WebhookSigner {
    /// Creates a new signer with the given secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            version: SignatureVersion::V1,
        }
    }

    /// Creates a signer with a specific version.
    pub fn with_version(secret: impl Into<String>, version: SignatureVersion) -> Self {
        Self {
            secret: secret.into(),
            version,
        }
    }

    /// Returns the signature version.
    pub fn version(&self) -> SignatureVersion {
        self.version
    }

    /// Generates the hex-encoded signature for a message.
    pub fn sign(&self, message: &SignedMessage<'_>) -> WebhookResult<String> {
        let mac = self.mac(message)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Generates a full signature header value (`sha256=<hex>`).
    pub fn sign_header(&self, message: &SignedMessage<'_>) -> WebhookResult<String> {
        Ok(format!("{}{}", SIGNATURE_PREFIX, self.sign(message)?))
    }

    /// Verifies a hex signature, with or without the `sha256=` prefix.
    ///
    /// The digest comparison runs in constant time.
    pub fn verify(&self, message: &SignedMessage<'_>, signature: &str) -> bool {
        let Some(provided) = decode_signature(signature) else {
            return false;
        };
        match self.mac(message) {
            Ok(mac) => mac.verify_slice(&provided).is_ok(),
            Err(_) => false,
        }
    }

    fn mac(&self, message: &SignedMessage<'_>) -> WebhookResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| WebhookError::Config(format!("invalid HMAC key: {}", e)))?;

        mac.update(message.timestamp.as_bytes());
        mac.update(b".");
        if self.version == SignatureVersion::V2 {
            mac.update(message.method.to_ascii_uppercase().as_bytes());
            mac.update(b".");
            mac.update(message.path.as_bytes());
            mac.update(b".");
        }
        mac.update(message.body);

        Ok(mac)
    }
}

/// Strips the optional prefix and decodes the hex digest.
fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    let trimmed = signature.trim();
    let hex_part = match trimmed.get(..SIGNATURE_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(SIGNATURE_PREFIX) => &trimmed[SIGNATURE_PREFIX.len()..],
        _ => trimmed,
    };
    if hex_part.is_empty() {
        return None;
    }
    hex::decode(hex_part).ok()
}

/// Returns the lowercase hex digest of a signature header, without prefix.
///
/// Two spellings of the same digest normalize to the same string, which keeps
/// replay keys stable.
pub fn normalize_signature(signature: &str) -> Option<String> {
    decode_signature(signature).map(hex::encode)
}

/// Which secret of a [`SecretSet`] produced a valid signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSlot {
    /// The long-lived current secret.
    Current,
    /// The rotation secret, trusted until its expiry.
    Next,
}

/// Current secret plus an optional rotation secret.
///
/// Producers may start signing with `next` before consumers stop trusting
/// `current`; `next` is trusted only while `now < next_expires_at`.
#[derive(Clone)]
pub struct SecretSet {
    current: String,
    next: Option<String>,
    next_expires_at: Option<DateTime<Utc>>,
}

impl SecretSet {
    /// Creates a set with only a current secret.
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            next: None,
            next_expires_at: None,
        }
    }

    /// Adds a rotation secret trusted until `expires_at`.
    pub fn with_next(mut self, next: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        self.next = Some(next.into());
        self.next_expires_at = Some(expires_at);
        self
    }

    /// Returns the current secret.
    pub fn current(&self) -> &str {
        &self.current
    }

    /// Returns the rotation secret if it is still trusted at `now`.
    pub fn active_next(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.next, self.next_expires_at) {
            (Some(next), Some(expires_at)) if now < expires_at => Some(next.as_str()),
            _ => None,
        }
    }

    /// Returns the rotation expiry, if a rotation is configured.
    pub fn next_expires_at(&self) -> Option<DateTime<Utc>> {
        self.next_expires_at
    }

    /// Returns true when a rotation secret has expired but was never promoted.
    pub fn needs_promotion(&self, now: DateTime<Utc>) -> bool {
        matches!((&self.next, self.next_expires_at), (Some(_), Some(expires_at)) if now >= expires_at)
    }

    /// Promotes an expired rotation secret to current and clears the rotation.
    ///
    /// Returns `None` when there is nothing to promote.
    pub fn promote_expired(&self, now: DateTime<Utc>) -> Option<SecretSet> {
        if !self.needs_promotion(now) {
            return None;
        }
        let next = self.next.clone()?;
        Some(SecretSet::new(next))
    }

    /// Finds the slot whose secret produced `signature`.
    ///
    /// The rotation secret is tried first while it is trusted; otherwise the
    /// current secret decides.
    pub fn matching_slot(
        &self,
        message: &SignedMessage<'_>,
        signature: &str,
        version: SignatureVersion,
        now: DateTime<Utc>,
    ) -> Option<SecretSlot> {
        if let Some(next) = self.active_next(now) {
            if WebhookSigner::with_version(next, version).verify(message, signature) {
                return Some(SecretSlot::Next);
            }
        }
        if WebhookSigner::with_version(self.current.as_str(), version).verify(message, signature) {
            return Some(SecretSlot::Current);
        }
        None
    }
}

impl fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSet")
            .field("current", &"<redacted>")
            .field("next", &self.next.as_ref().map(|_| "<redacted>"))
            .field("next_expires_at", &self.next_expires_at)
            .finish()
    }
}

/// Parses a timestamp header into epoch seconds.
///
/// Accepts epoch seconds or an ISO-8601 date-time. A date-time without an
/// offset is read as UTC.
pub fn parse_timestamp(raw: &str) -> WebhookResult<i64> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(WebhookError::MalformedTimestamp(raw.to_string()));
    }

    if value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse::<i64>()
            .map_err(|_| WebhookError::MalformedTimestamp(raw.to_string()));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.timestamp());
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().timestamp())
        .map_err(|_| WebhookError::MalformedTimestamp(raw.to_string()))
}

/// Checks that `timestamp` lies within `max_skew_secs` of `now`.
///
/// A skew of exactly `max_skew_secs` is accepted.
pub fn check_freshness(timestamp: i64, now: i64, max_skew_secs: i64) -> WebhookResult<()> {
    let age = now.saturating_sub(timestamp);
    if age > max_skew_secs {
        return Err(WebhookError::StaleTimestamp {
            skew_secs: age,
            max_skew_secs,
        });
    }
    if -age > max_skew_secs {
        return Err(WebhookError::FutureTimestamp {
            skew_secs: -age,
            max_skew_secs,
        });
    }
    Ok(())
}

/// The raw timestamp header, then its epoch form when that differs.
pub(crate) fn signed_forms<'a>(raw: &'a str, epoch: &'a str) -> impl Iterator<Item = &'a str> {
    std::iter::once(raw).chain((raw != epoch).then_some(epoch))
}

/// Verifies a delivery sent by this system.
///
/// Intended for third-party integrators: checks the `timestamp.body`
/// signature (V1) and that the timestamp is within `max_skew_secs` of now.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    raw_body: &[u8],
    signature: &str,
    max_skew_secs: i64,
) -> WebhookResult<()> {
    verify_signature_at(&SystemClock, secret, timestamp, raw_body, signature, max_skew_secs)
}

/// [`verify_signature`] against an explicit clock.
pub fn verify_signature_at(
    clock: &dyn Clock,
    secret: &str,
    timestamp: &str,
    raw_body: &[u8],
    signature: &str,
    max_skew_secs: i64,
) -> WebhookResult<()> {
    let ts = parse_timestamp(timestamp)?;
    check_freshness(ts, clock.now_secs(), max_skew_secs)?;

    let signer = WebhookSigner::new(secret);
    let epoch = ts.to_string();
    if !signed_forms(timestamp, &epoch).any(|form| signer.verify(&SignedMessage::new(form, raw_body), signature)) {
        return Err(WebhookError::SignatureInvalid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_sign_and_verify() {
        let signer = WebhookSigner::new("test-secret");
        let message = SignedMessage::new("1234567890", b"test payload");

        let signature = signer.sign(&message).unwrap();
        assert!(signer.verify(&message, &signature));

        // Wrong payload should fail
        assert!(!signer.verify(&SignedMessage::new("1234567890", b"wrong payload"), &signature));

        // Wrong timestamp should fail
        assert!(!signer.verify(&SignedMessage::new("1234567891", b"test payload"), &signature));
    }

    #[test]
    fn test_sign_header_has_prefix_and_verifies() {
        let signer = WebhookSigner::new("test-secret");
        let message = SignedMessage::new("1234567890", b"test payload");

        let header = signer.sign_header(&message).unwrap();
        assert!(header.starts_with("sha256="));
        assert!(signer.verify(&message, &header));
        assert!(signer.verify(&message, &header.to_uppercase().replacen("SHA256=", "sha256=", 1)));
    }

    #[test]
    fn test_v2_binds_method_and_path() {
        let signer = WebhookSigner::with_version("s1", SignatureVersion::V2);
        let body = br#"{"id":"evt_1"}"#;
        let message = SignedMessage::new("1700000000", body).with_request("POST", "/hooks/stripe");
        let signature = signer.sign(&message).unwrap();

        assert!(signer.verify(&message, &signature));
        assert!(!signer.verify(
            &SignedMessage::new("1700000000", body).with_request("PUT", "/hooks/stripe"),
            &signature
        ));
        assert!(!signer.verify(
            &SignedMessage::new("1700000000", body).with_request("POST", "/hooks/other"),
            &signature
        ));
        assert!(!signer.verify(
            &SignedMessage::new("1700000000", br#"{"id":"evt_2"}"#).with_request("POST", "/hooks/stripe"),
            &signature
        ));
    }

    #[test]
    fn test_flipping_any_signature_character_fails() {
        let signer = WebhookSigner::with_version("s1", SignatureVersion::V2);
        let message = SignedMessage::new("1700000000", b"{}").with_request("POST", "/h");
        let signature = signer.sign(&message).unwrap();

        for i in 0..signature.len() {
            let mut chars: Vec<char> = signature.chars().collect();
            chars[i] = if chars[i] == '0' { '1' } else { '0' };
            let tampered: String = chars.into_iter().collect();
            assert!(!signer.verify(&message, &tampered), "position {} accepted", i);
        }
    }

    #[test]
    fn test_malformed_signatures_rejected() {
        let signer = WebhookSigner::new("s1");
        let message = SignedMessage::new("1", b"x");
        assert!(!signer.verify(&message, ""));
        assert!(!signer.verify(&message, "sha256="));
        assert!(!signer.verify(&message, "not-hex"));
        assert!(!signer.verify(&message, "abc"));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("1700000000").unwrap(), NOW);
        assert_eq!(parse_timestamp("2023-11-14T22:13:20Z").unwrap(), NOW);
        assert_eq!(parse_timestamp("2023-11-14T23:13:20+01:00").unwrap(), NOW);
        assert_eq!(parse_timestamp("2023-11-14T22:13:20.000").unwrap(), NOW);
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("-5").is_err());
    }

    #[test]
    fn test_freshness_boundaries() {
        assert!(check_freshness(NOW - 300, NOW, 300).is_ok());
        assert!(check_freshness(NOW + 300, NOW, 300).is_ok());
        assert!(matches!(
            check_freshness(NOW - 301, NOW, 300),
            Err(WebhookError::StaleTimestamp { skew_secs: 301, .. })
        ));
        assert!(matches!(
            check_freshness(NOW + 301, NOW, 300),
            Err(WebhookError::FutureTimestamp { skew_secs: 301, .. })
        ));
    }

    #[test]
    fn test_rotation_secret_trusted_until_expiry() {
        let expires = DateTime::from_timestamp(NOW + 3600, 0).unwrap();
        let secrets = SecretSet::new("cur").with_next("next", expires);
        let message = SignedMessage::new("1700000000", b"{}");
        let signed_with_next = WebhookSigner::new("next").sign(&message).unwrap();
        let signed_with_current = WebhookSigner::new("cur").sign(&message).unwrap();

        let before = DateTime::from_timestamp(NOW, 0).unwrap();
        assert_eq!(
            secrets.matching_slot(&message, &signed_with_next, SignatureVersion::V1, before),
            Some(SecretSlot::Next)
        );
        assert_eq!(
            secrets.matching_slot(&message, &signed_with_current, SignatureVersion::V1, before),
            Some(SecretSlot::Current)
        );

        assert_eq!(
            secrets.matching_slot(&message, &signed_with_next, SignatureVersion::V1, expires),
            None
        );
        assert_eq!(
            secrets.matching_slot(&message, &signed_with_current, SignatureVersion::V1, expires),
            Some(SecretSlot::Current)
        );
    }

    #[test]
    fn test_promote_expired_rotation() {
        let expires = DateTime::from_timestamp(NOW, 0).unwrap();
        let secrets = SecretSet::new("cur").with_next("next", expires);

        let before = DateTime::from_timestamp(NOW - 1, 0).unwrap();
        assert!(!secrets.needs_promotion(before));
        assert!(secrets.promote_expired(before).is_none());

        let promoted = secrets.promote_expired(expires).unwrap();
        assert_eq!(promoted.current(), "next");
        assert!(promoted.next_expires_at().is_none());
        assert!(!promoted.needs_promotion(expires));
    }

    #[test]
    fn test_secret_set_debug_redacts() {
        let secrets = SecretSet::new("super-secret");
        assert!(!format!("{:?}", secrets).contains("super-secret"));
    }

    #[test]
    fn test_verify_signature_helper() {
        let clock = FixedClock::at_secs(NOW);
        let body = br#"{"id":"evt_1","topic":"load.updated"}"#;
        let ts = NOW.to_string();
        let signature = WebhookSigner::new("shared")
            .sign(&SignedMessage::new(&ts, body))
            .unwrap();

        assert!(verify_signature_at(&clock, "shared", &ts, body, &signature, 300).is_ok());
        assert!(matches!(
            verify_signature_at(&clock, "other", &ts, body, &signature, 300),
            Err(WebhookError::SignatureInvalid)
        ));

        clock.advance(chrono::Duration::seconds(301));
        assert!(matches!(
            verify_signature_at(&clock, "shared", &ts, body, &signature, 300),
            Err(WebhookError::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn test_verify_signature_accepts_iso_header_over_epoch() {
        let clock = FixedClock::at_secs(NOW);
        let body = br#"{"id":"evt_2"}"#;
        let signature = WebhookSigner::new("shared")
            .sign(&SignedMessage::new(&NOW.to_string(), body))
            .unwrap();

        assert!(verify_signature_at(&clock, "shared", "2023-11-14T22:13:20Z", body, &signature, 300).is_ok());
        assert!(verify_signature_at(&clock, "shared", "2023-11-14T22:13:20.000Z", body, &signature, 300).is_ok());
    }

    #[test]
    fn test_signed_forms() {
        assert_eq!(signed_forms("100", "100").collect::<Vec<_>>(), vec!["100"]);
        assert_eq!(
            signed_forms("1970-01-01T00:01:40Z", "100").collect::<Vec<_>>(),
            vec!["1970-01-01T00:01:40Z", "100"]
        );
    }
}
