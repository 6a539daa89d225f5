//! Webhook signature verification
//!
//! The processor signs each delivery with HMAC-SHA256 over `"{timestamp}.{raw body}"` and
//! sends `t=<timestamp>,v1=<hex digest>` in the signature header. Several `v1` entries may
//! be present while the signing secret is being rolled.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{SettlementError, SettlementResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_seconds: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_seconds,
        }
    }

    pub fn verify(&self, payload: &[u8], signature_header: &str) -> SettlementResult<()> {
        self.verify_at(payload, signature_header, Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> SettlementResult<()> {
        if self.secret.is_empty() {
            return Err(SettlementError::InvalidSignature);
        }

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SettlementError::InvalidSignature)?;
        if now.abs_diff(timestamp) > self.tolerance_seconds.unsigned_abs() {
            return Err(SettlementError::InvalidSignature);
        }

        for candidate in &candidates {
            let mac = self.mac(timestamp, payload)?;
            if mac.verify_slice(candidate).is_ok() {
                return Ok(());
            }
        }

        Err(SettlementError::InvalidSignature)
    }

    /// Build a signature header for `payload`; the processor's side of `verify`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> SettlementResult<String> {
        let digest = self.mac(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> SettlementResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|err| SettlementError::Configuration(format!("webhook secret: {err}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new("whsec_test", 300)
    }

    #[test]
    fn accepts_own_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().sign(payload, NOW).unwrap();
        assert!(verifier().verify_at(payload, &header, NOW + 10).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let header = verifier().sign(br#"{"amount":100}"#, NOW).unwrap();
        let err = verifier()
            .verify_at(br#"{"amount":999}"#, &header, NOW)
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidSignature));
    }

    #[test]
    fn rejects_other_secret() {
        let payload = b"{}";
        let header = WebhookVerifier::new("whsec_other", 300)
            .sign(payload, NOW)
            .unwrap();
        assert!(verifier().verify_at(payload, &header, NOW).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = b"{}";
        let header = verifier().sign(payload, NOW).unwrap();
        assert!(verifier().verify_at(payload, &header, NOW + 301).is_err());
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let payload = b"{}";
        let valid = verifier().sign(payload, NOW).unwrap();
        let digest = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1={},v1={digest}", "00".repeat(32));
        assert!(verifier().verify_at(payload, &header, NOW).is_ok());
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(verifier().verify_at(b"{}", "garbage", NOW).is_err());
        assert!(verifier().verify_at(b"{}", "", NOW).is_err());
    }

    #[test]
    fn rejects_extreme_timestamps() {
        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={timestamp},v1={}", "00".repeat(32));
            let err = verifier().verify_at(b"{}", &header, NOW).unwrap_err();
            assert!(matches!(err, SettlementError::InvalidSignature));
        }
        let header = verifier().sign(b"{}", NOW).unwrap();
        assert!(verifier().verify_at(b"{}", &header, i64::MIN).is_err());
    }

    #[test]
    fn empty_secret_never_verifies() {
        let unsigned = WebhookVerifier::new("", 300);
        let header = verifier().sign(b"{}", NOW).unwrap();
        assert!(unsigned.verify_at(b"{}", &header, NOW).is_err());
    }
}
