//! Origin credential expiry.
//!
//! Repository vendors commonly hand out JWT access tokens as the Basic auth
//! password.  The payload is decoded without verifying the signature, only to
//! read `exp`, so operators can alert before the credential lapses.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::Utc;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use tracing::{debug, warn};

use crate::metrics::CredentialLabels;

/// base64url that accepts payloads with or without `=` padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenDecodeError {
    #[error("token does not have a payload segment")]
    BadStructure,

    #[error("token payload is not valid base64url")]
    BadEncoding,

    #[error("token payload is not a JSON object")]
    BadJson,
}

/// The `exp` claim of `token`, if present.
pub fn expiration(token: &str) -> Result<Option<i64>, TokenDecodeError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_), Some(payload)) => payload,
        _ => return Err(TokenDecodeError::BadStructure),
    };

    let bytes = URL_SAFE_LENIENT
        .decode(payload)
        .map_err(|_| TokenDecodeError::BadEncoding)?;
    let claims: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&bytes).map_err(|_| TokenDecodeError::BadJson)?;

    match claims.get("exp") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or(TokenDecodeError::BadJson),
        Some(_) => Err(TokenDecodeError::BadJson),
    }
}

/// `exp - now`; negative once the token has expired.
pub fn seconds_until_expiration(token: &str, now: i64) -> Result<Option<i64>, TokenDecodeError> {
    Ok(expiration(token)?.map(|exp| exp.saturating_sub(now)))
}

/// Refreshes the expiry gauge from the configured origin password.
pub struct ExpiryProbe {
    password: Option<String>,
    gauge: Family<CredentialLabels, Gauge>,
    labels: CredentialLabels,
}

impl ExpiryProbe {
    pub fn new(password: Option<String>, gauge: Family<CredentialLabels, Gauge>) -> Self {
        Self {
            password,
            gauge,
            labels: CredentialLabels {
                source: "origin".to_string(),
            },
        }
    }

    /// Recompute the gauge.  Without a readable `exp` the sample is
    /// withdrawn, so scrapes see no value rather than a stale or zero one.
    pub fn refresh(&self) {
        let Some(password) = self.password.as_deref() else {
            self.gauge.remove(&self.labels);
            return;
        };
        match seconds_until_expiration(password, Utc::now().timestamp()) {
            Ok(Some(seconds)) => {
                self.gauge.get_or_create(&self.labels).set(seconds);
                if seconds < 0 {
                    warn!(seconds, "origin credential has expired");
                }
            }
            Ok(None) => {
                debug!("origin credential has no exp claim");
                self.gauge.remove(&self.labels);
            }
            Err(e) => {
                debug!(error = %e, "origin credential is not a decodable JWT");
                self.gauge.remove(&self.labels);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use super::*;
    use crate::metrics::MetricsRegistry;

    fn token_with(payload: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_valid_token_reports_remaining_seconds() {
        let token = token_with(r#"{"sub":"svc","exp":1700003600}"#);
        assert_eq!(seconds_until_expiration(&token, 1_700_000_000), Ok(Some(3600)));
    }

    #[test]
    fn test_expired_token_reports_negative_seconds() {
        let token = token_with(r#"{"exp":1700000000}"#);
        assert_eq!(seconds_until_expiration(&token, 1_700_000_060), Ok(Some(-60)));
    }

    #[test]
    fn test_missing_exp_is_none() {
        let token = token_with(r#"{"sub":"svc"}"#);
        assert_eq!(expiration(&token), Ok(None));
    }

    #[test]
    fn test_single_segment_is_bad_structure() {
        assert_eq!(expiration("headeronly"), Err(TokenDecodeError::BadStructure));
    }

    #[test]
    fn test_invalid_base64_is_bad_encoding() {
        assert_eq!(
            expiration("header.invalid_base64_payload!.signature"),
            Err(TokenDecodeError::BadEncoding)
        );
    }

    #[test]
    fn test_non_json_payload_is_bad_json() {
        let token = token_with("not json");
        assert_eq!(expiration(&token), Err(TokenDecodeError::BadJson));
    }

    #[test]
    fn test_padded_payload_is_accepted() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode(r#"{"exp":10}"#);
        assert!(padded.ends_with('='));
        assert_eq!(expiration(&format!("h.{padded}.s")), Ok(Some(10)));
    }

    #[test]
    fn test_two_segments_are_enough() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"exp":42}"#);
        assert_eq!(expiration(&format!("h.{payload}")), Ok(Some(42)));
    }

    #[test]
    fn test_extreme_exp_does_not_overflow() {
        let token = token_with(r#"{"exp":-9223372036854775808}"#);
        assert_eq!(seconds_until_expiration(&token, 1_700_000_000), Ok(Some(i64::MIN)));

        let token = token_with(r#"{"exp":9223372036854775807}"#);
        assert_eq!(seconds_until_expiration(&token, -10), Ok(Some(i64::MAX)));
    }

    fn origin_labels() -> CredentialLabels {
        CredentialLabels {
            source: "origin".to_string(),
        }
    }

    #[test]
    fn test_probe_updates_gauge() {
        let gauge = Family::<CredentialLabels, Gauge>::default();
        let exp = Utc::now().timestamp() + 3600;
        let probe = ExpiryProbe::new(Some(token_with(&format!(r#"{{"exp":{exp}}}"#))), gauge.clone());

        probe.refresh();
        let value = gauge.get_or_create(&origin_labels()).get();
        assert!((3590..=3600).contains(&value), "{value}");
    }

    #[test]
    fn test_probe_withdraws_sample_without_exp() {
        let registry = MetricsRegistry::new();
        let gauge = registry.metrics.credential_seconds_until_expiration.clone();
        let series = r#"mavencache_origin_credential_seconds_until_expiration{source="origin"}"#;

        let exp = Utc::now().timestamp() + 3600;
        ExpiryProbe::new(Some(token_with(&format!(r#"{{"exp":{exp}}}"#))), gauge.clone()).refresh();
        assert!(registry.encode().unwrap().contains(series));

        for password in [
            Some("plain-password".to_string()),
            Some(token_with(r#"{"sub":"svc"}"#)),
            None,
        ] {
            gauge.get_or_create(&origin_labels()).set(7);
            ExpiryProbe::new(password, gauge.clone()).refresh();
            let text = registry.encode().unwrap();
            assert!(!text.contains(series), "{text}");
            assert!(!text.contains("_seconds_until_expiration 0"), "{text}");
        }
    }
}
