use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::SignatureError;
use crate::types::Provider;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew for timestamped signature schemes, in seconds.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

fn hmac_sha256(secret: &str, parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => unreachable!("hmac accepts any key length"),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Hex HMAC-SHA256 of `body`, the value `verify` accepts.
pub fn sign(body: &[u8], secret: &str) -> String {
    hex::encode(hmac_sha256(secret, &[body]))
}

/// Verify a plain hex HMAC-SHA256 signature over the raw body.
/// Accepts an optional `sha256=` prefix.
pub fn verify(body: &[u8], signature_header: &str, secret: &str) -> Result<(), SignatureError> {
    let provided = signature_header.trim();
    if provided.is_empty() {
        return Err(SignatureError::Missing);
    }
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    compare(&hmac_sha256(secret, &[body]), provided)
}

fn compare(expected: &[u8], provided_hex: &str) -> Result<(), SignatureError> {
    let provided = hex::decode(provided_hex)
        .map_err(|_| SignatureError::Malformed("signature is not hex".to_string()))?;
    if bool::from(expected.ct_eq(&provided)) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// `t=<ts>,v1=<hex>[,v1=<hex>...]`, as used by Stripe and Calendly.
struct TimestampedHeader<'a> {
    timestamp: &'a str,
    signatures: Vec<&'a str>,
}

fn parse_timestamped(header: &str) -> Result<TimestampedHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for item in header.split(',') {
        match item.trim().split_once('=') {
            Some(("t", ts)) => timestamp = Some(ts),
            Some(("v1", sig)) => signatures.push(sig),
            // Other schemes (e.g. Stripe's v0) are ignored.
            Some(_) => {}
            None => {
                return Err(SignatureError::Malformed(format!(
                    "unexpected element '{item}'"
                )))
            }
        }
    }
    let timestamp =
        timestamp.ok_or_else(|| SignatureError::Malformed("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed("missing v1 signature".to_string()));
    }
    Ok(TimestampedHeader {
        timestamp,
        signatures,
    })
}

fn check_timestamp(timestamp: &str, now: DateTime<Utc>) -> Result<(), SignatureError> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::Malformed("timestamp is not an integer".to_string()))?;
    match now.timestamp().checked_sub(ts).map(i64::unsigned_abs) {
        Some(skew) if skew <= TIMESTAMP_TOLERANCE_SECS.unsigned_abs() => Ok(()),
        _ => Err(SignatureError::StaleTimestamp),
    }
}

/// Verify a `t=,v1=` header over `"<t>.<body>"`. Any matching `v1` passes.
pub fn verify_timestamped(
    body: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let parsed = parse_timestamped(header)?;
    check_timestamp(parsed.timestamp, now)?;
    let expected = hmac_sha256(secret, &[parsed.timestamp.as_bytes(), b".", body]);

    let mut result = Err(SignatureError::Mismatch);
    for sig in parsed.signatures {
        match compare(&expected, sig) {
            Ok(()) => return Ok(()),
            // Keep looking; another v1 may match after a secret rotation.
            Err(err) => result = Err(err),
        }
    }
    result
}

/// Verify Zoom's `v0=<hex>` signature over `"v0:<ts>:<body>"`.
pub fn verify_zoom(
    body: &[u8],
    signature: &str,
    timestamp: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let provided = signature
        .trim()
        .strip_prefix("v0=")
        .ok_or_else(|| SignatureError::Malformed("expected v0= prefix".to_string()))?;
    check_timestamp(timestamp, now)?;
    let expected = hmac_sha256(
        secret,
        &[b"v0:", timestamp.as_bytes(), b":", body],
    );
    compare(&expected, provided)
}

/// `encryptedToken` for Zoom's endpoint URL validation challenge.
pub fn zoom_validation_token(plain_token: &str, secret: &str) -> String {
    sign(plain_token.as_bytes(), secret)
}

fn header<'a>(headers: &'a HeaderMap, names: &[&str]) -> Result<&'a str, SignatureError> {
    let value = names
        .iter()
        .find_map(|name| headers.get(*name))
        .ok_or(SignatureError::Missing)?;
    value
        .to_str()
        .map_err(|_| SignatureError::Malformed("header is not visible ASCII".to_string()))
}

/// Verify a delivery using the scheme the provider signs with.
pub fn verify_delivery(
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    match provider {
        Provider::Calcom => {
            let sig = header(headers, &["x-cal-signature-256", "x-cal-signature"])?;
            verify(body, sig, secret)
        }
        Provider::Calendly => {
            let sig = header(headers, &["calendly-webhook-signature", "x-calendly-signature"])?;
            verify_timestamped(body, sig, secret, now)
        }
        Provider::Stripe => {
            let sig = header(headers, &["stripe-signature"])?;
            verify_timestamped(body, sig, secret, now)
        }
        Provider::Zoom => {
            let sig = header(headers, &["x-zm-signature"])?;
            let ts = header(headers, &["x-zm-request-timestamp"])?;
            verify_zoom(body, sig, ts, secret, now)
        }
    }
}

/// Header set a provider would send for `body`. Used to drive deliveries in
/// tests and local tooling.
pub fn signed_headers(
    provider: Provider,
    body: &[u8],
    secret: &str,
    now: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    let ts = now.timestamp().to_string();
    match provider {
        Provider::Calcom => vec![("x-cal-signature-256", sign(body, secret))],
        Provider::Calendly | Provider::Stripe => {
            let sig = hex::encode(hmac_sha256(secret, &[ts.as_bytes(), b".", body]));
            let name = if provider == Provider::Stripe {
                "stripe-signature"
            } else {
                "calendly-webhook-signature"
            };
            vec![(name, format!("t={ts},v1={sig}"))]
        }
        Provider::Zoom => {
            let sig = hex::encode(hmac_sha256(secret, &[b"v0:", ts.as_bytes(), b":", body]));
            vec![
                ("x-zm-signature", format!("v0={sig}")),
                ("x-zm-request-timestamp", ts),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn signed_body_verifies() {
        let body = br#"{"triggerEvent":"BOOKING_CREATED"}"#;
        let sig = sign(body, SECRET);
        assert!(verify(body, &sig, SECRET).is_ok());
        assert!(verify(body, &format!("sha256={sig}"), SECRET).is_ok());
    }

    #[test]
    fn any_single_byte_mutation_fails() {
        let body = br#"{"id":"evt_1","amount":4200}"#.to_vec();
        let sig = sign(&body, SECRET);

        for i in 0..body.len() {
            let mut mutated = body.clone();
            mutated[i] ^= 0x01;
            assert!(verify(&mutated, &sig, SECRET).is_err(), "body byte {i}");
        }

        let sig_bytes = sig.as_bytes();
        for i in 0..sig_bytes.len() {
            let mut mutated = sig_bytes.to_vec();
            mutated[i] = if mutated[i] == b'0' { b'1' } else { b'0' };
            let mutated = String::from_utf8(mutated).unwrap();
            assert!(verify(&body, &mutated, SECRET).is_err(), "sig byte {i}");
        }
    }

    #[test]
    fn wrong_secret_and_empty_header_fail() {
        let body = b"payload";
        let sig = sign(body, SECRET);
        assert_eq!(
            verify(body, &sig, "other-secret"),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(verify(body, "", SECRET), Err(SignatureError::Missing));
        assert!(matches!(
            verify(body, "not-hex!", SECRET),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn timestamped_scheme_accepts_any_matching_v1() {
        let now = Utc::now();
        let body = br#"{"id":"evt_2"}"#;
        let headers = signed_headers(Provider::Stripe, body, SECRET, now);
        let (_, value) = &headers[0];
        let with_rotation = format!("{value},v1={}", "ab".repeat(32));
        assert!(verify_timestamped(body, value, SECRET, now).is_ok());
        assert!(verify_timestamped(body, &with_rotation, SECRET, now).is_ok());

        let rotated_first = value.replacen("v1=", &format!("v1={},v1=", "cd".repeat(32)), 1);
        assert!(verify_timestamped(body, &rotated_first, SECRET, now).is_ok());
    }

    #[test]
    fn timestamped_scheme_rejects_stale_deliveries() {
        let signed_at = Utc::now();
        let body = b"{}";
        let headers = signed_headers(Provider::Calendly, body, SECRET, signed_at);
        let later = signed_at + chrono::Duration::seconds(TIMESTAMP_TOLERANCE_SECS + 1);
        assert_eq!(
            verify_timestamped(body, &headers[0].1, SECRET, later),
            Err(SignatureError::StaleTimestamp)
        );
    }

    #[test]
    fn extreme_timestamps_are_stale() {
        let now = Utc::now();
        for ts in [i64::MIN, i64::MAX, i64::MIN + 1] {
            let header = format!("t={ts},v1={}", "00".repeat(32));
            assert_eq!(
                verify_timestamped(b"{}", &header, SECRET, now),
                Err(SignatureError::StaleTimestamp),
                "t={ts}"
            );
            assert_eq!(
                verify_zoom(b"{}", "v0=00", &ts.to_string(), SECRET, now),
                Err(SignatureError::StaleTimestamp),
                "ts={ts}"
            );
        }
    }

    #[test]
    fn timestamped_header_must_have_parts() {
        let now = Utc::now();
        assert!(matches!(
            verify_timestamped(b"{}", "v1=abcd", SECRET, now),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            verify_timestamped(b"{}", "t=123", SECRET, now),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn provider_dispatch_reads_the_right_headers() {
        let now = Utc::now();
        let body = br#"{"event":"meeting.ended"}"#;
        for provider in Provider::ALL {
            let mut headers = HeaderMap::new();
            for (name, value) in signed_headers(provider, body, SECRET, now) {
                headers.insert(name, HeaderValue::from_str(&value).unwrap());
            }
            assert!(
                verify_delivery(provider, &headers, body, SECRET, now).is_ok(),
                "{provider}"
            );
            assert!(verify_delivery(provider, &headers, b"tampered", SECRET, now).is_err());
            assert_eq!(
                verify_delivery(provider, &HeaderMap::new(), body, SECRET, now),
                Err(SignatureError::Missing)
            );
        }
    }

    #[test]
    fn calcom_accepts_legacy_header() {
        let body = b"{}";
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-cal-signature",
            HeaderValue::from_str(&sign(body, SECRET)).unwrap(),
        );
        assert!(verify_delivery(Provider::Calcom, &headers, body, SECRET, Utc::now()).is_ok());
    }

    #[test]
    fn zoom_validation_token_is_hex_hmac() {
        let token = zoom_validation_token("qgg8vlvZRS6UYooatFL8Aw", SECRET);
        assert_eq!(token.len(), 64);
        assert_eq!(token, sign(b"qgg8vlvZRS6UYooatFL8Aw", SECRET));
    }
}
