//! HMAC-SHA256 signing for provider webhooks and unsubscribe links.
//!
//! Provider webhooks carry two headers:
//! - `X-Webhook-Timestamp`: Unix epoch seconds when the webhook was generated
//! - `X-Webhook-Signature`: hex HMAC-SHA256 of `"{timestamp}.{raw body}"`

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `message` under `key`.
pub fn hmac_hex(key: &str, message: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a provider webhook signature.
///
/// Returns `true` only if all fields are present, the timestamp is within
/// `max_age_seconds` of now, and the signature matches.
pub fn verify_webhook_signature(
    signing_key: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    max_age_seconds: u64,
) -> bool {
    if signing_key.is_empty() || timestamp.is_empty() || signature.is_empty() {
        warn!(
            has_signing_key = !signing_key.is_empty(),
            has_timestamp = !timestamp.is_empty(),
            has_signature = !signature.is_empty(),
            "webhook_signature_missing_fields"
        );
        return false;
    }

    let webhook_time: u64 = match timestamp.parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp = %timestamp, "webhook_signature_invalid_timestamp");
            return false;
        }
    };

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let age = current_time.abs_diff(webhook_time);
    if age > max_age_seconds {
        warn!(
            webhook_time = webhook_time,
            current_time = current_time,
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "webhook_signature_stale"
        );
        return false;
    }

    let mut signed = Vec::with_capacity(timestamp.len() + 1 + body.len());
    signed.extend_from_slice(timestamp.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(body);

    let expected = hmac_hex(signing_key, &signed);
    let valid = constant_time_compare(&expected, signature.trim());

    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = signature.len(),
            "webhook_signature_mismatch"
        );
    }

    valid
}

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check if a signing key is configured.
pub fn is_signature_verification_enabled(signing_key: &Option<String>) -> bool {
    signing_key
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now_secs() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .to_string()
    }

    #[test]
    fn test_verify_signature_missing_fields() {
        assert!(!verify_webhook_signature("", "123", b"{}", "sig", 300));
        assert!(!verify_webhook_signature("key", "", b"{}", "sig", 300));
        assert!(!verify_webhook_signature("key", "123", b"{}", "", 300));
    }

    #[test]
    fn test_verify_signature_invalid_timestamp() {
        assert!(!verify_webhook_signature("key", "yesterday", b"{}", "sig", 300));
    }

    #[test]
    fn test_verify_signature_stale() {
        // Year 2000
        assert!(!verify_webhook_signature("key", "946684800", b"{}", "sig", 300));
    }

    #[test]
    fn test_verify_signature_valid() {
        let key = "whsec-test";
        let timestamp = now_secs();
        let body = br#"{"type":"email.bounced"}"#;
        let signature = hmac_hex(key, format!("{timestamp}.{}", std::str::from_utf8(body).unwrap()).as_bytes());

        assert!(verify_webhook_signature(key, &timestamp, body, &signature, 300));
        assert!(!verify_webhook_signature(key, &timestamp, b"{\"type\":\"x\"}", &signature, 300));
        assert!(!verify_webhook_signature("other", &timestamp, body, &signature, 300));
    }

    #[test]
    fn test_hmac_hex_is_deterministic() {
        assert_eq!(hmac_hex("k", b"c1:ct1"), hmac_hex("k", b"c1:ct1"));
        assert_ne!(hmac_hex("k", b"c1:ct1"), hmac_hex("k", b"c1:ct2"));
        assert_eq!(hmac_hex("k", b"x").len(), 64);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn test_is_signature_verification_enabled() {
        assert!(!is_signature_verification_enabled(&None));
        assert!(!is_signature_verification_enabled(&Some("".to_string())));
        assert!(!is_signature_verification_enabled(&Some("   ".to_string())));
        assert!(is_signature_verification_enabled(&Some("key123".to_string())));
    }
}
