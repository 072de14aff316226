//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac-sha256>`, where the MAC is
//! computed over `"<t>.<payload>"`. Several `v1` entries may be present
//! during secret rotation; any match is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance_secs: u64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance: std::time::Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: tolerance.as_secs(),
        }
    }

    /// Check `header` against `payload` at time `now` (unix seconds).
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<(), SignatureError> {
        let parsed = parse_header(header)?;
        // `t` is untrusted until the MAC matches
        if now.abs_diff(parsed.timestamp) > self.tolerance_secs {
            debug!(timestamp = parsed.timestamp, now, "webhook signature outside tolerance");
            return Err(SignatureError::Expired);
        }

        let expected = self.mac(parsed.timestamp, payload)?;
        let matched = parsed
            .signatures
            .iter()
            .filter_map(|s| hex_decode(s))
            .any(|provided| constant_time_compare(&expected, &provided));
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Produce a header for `payload` signed at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let mac = self.mac(timestamp, payload)?;
        Ok(format!("t={timestamp},v1={}", hex_encode(&mac)))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| SignatureError::Mismatch)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse().map_err(|_| SignatureError::MalformedHeader)?);
            }
            Some(("v1", value)) => signatures.push(value),
            // unknown schemes are skipped
            Some(_) => {}
            None => return Err(SignatureError::MalformedHeader),
        }
    }
    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader {
            timestamp,
            signatures,
        }),
        _ => Err(SignatureError::MalformedHeader),
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
