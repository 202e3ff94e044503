//! Webhook payload signatures.
//!
//! Payloads are signed with HMAC-SHA256 over the exact body bytes sent on the
//! wire. The header value is `sha256=` + lowercase hex of the tag.

use ring::hmac;

/// Header value prefix.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Computes the `X-Webhook-Signature` value for a body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(tag.as_ref()))
}

/// Verifies a received signature header against a body.
///
/// Constant-time on the tag comparison (delegated to `ring`).
pub fn verify(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_tag) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(tag) = hex::decode(hex_tag) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_format() {
        let sig = sign("shh", b"{\"event\":\"Connected\"}");
        assert!(sig.starts_with("sha256="));
        // 32-byte tag → 64 hex chars
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(sig[7..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, sig.to_lowercase());
    }

    #[test]
    fn test_sign_is_deterministic() {
        assert_eq!(sign("k", b"body"), sign("k", b"body"));
        assert_ne!(sign("k", b"body"), sign("k", b"other"));
        assert_ne!(sign("k", b"body"), sign("k2", b"body"));
    }

    #[test]
    fn test_verify_roundtrip() {
        let body = br#"{"event":"Message","sessionId":"abc","timestamp":1,"data":{}}"#;
        let sig = sign("shh", body);
        assert!(verify("shh", body, &sig));
        assert!(!verify("wrong", body, &sig));
        assert!(!verify("shh", b"tampered", &sig));
    }

    #[test]
    fn test_verify_rejects_malformed_headers() {
        assert!(!verify("shh", b"body", "md5=abc"));
        assert!(!verify("shh", b"body", "sha256=nothex"));
        assert!(!verify("shh", b"body", ""));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let sig = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }
}
