//! Locally issued tokens.
//!
//! The RSA key pair is read once at startup.  Tokens carry `iss = "self"`,
//! the subject, `iat`/`exp` and the granted scopes joined by spaces.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Issuer claim of every locally minted token.
pub const LOCAL_ISSUER: &str = "self";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
    /// Space-separated scope list.
    #[serde(default)]
    pub scope: String,
}

impl Claims {
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(str::to_string).collect()
    }
}

pub struct LocalTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl LocalTokens {
    /// Build from PEM bytes: PKCS#8 private key, SPKI public key.
    pub fn from_pem(private_pem: &[u8], public_pem: &[u8]) -> Result<Self> {
        let encoding =
            EncodingKey::from_rsa_pem(private_pem).context("invalid RSA private key PEM")?;
        let decoding =
            DecodingKey::from_rsa_pem(public_pem).context("invalid RSA public key PEM")?;
        Ok(Self { encoding, decoding })
    }

    pub fn from_pem_files(private_path: impl AsRef<Path>, public_path: impl AsRef<Path>) -> Result<Self> {
        let private_path = private_path.as_ref();
        let public_path = public_path.as_ref();
        let private_pem = std::fs::read(private_path)
            .with_context(|| format!("failed to read private key: {}", private_path.display()))?;
        let public_pem = std::fs::read(public_path)
            .with_context(|| format!("failed to read public key: {}", public_path.display()))?;
        Self::from_pem(&private_pem, &public_pem)
    }

    /// Mint a token for `subject` valid for `ttl_secs` from now.
    pub fn issue(&self, subject: &str, scopes: &[String], ttl_secs: u64) -> Result<String> {
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(ttl_secs).context("token TTL out of range")?;
        let claims = Claims {
            iss: LOCAL_ISSUER.to_string(),
            sub: subject.to_string(),
            iat,
            exp: iat.saturating_add(ttl),
            scope: scopes.join(" "),
        };
        self.sign(&claims)
    }

    pub(crate) fn sign(&self, claims: &Claims) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, &self.encoding)
            .context("failed to sign token")
    }

    /// Check signature, issuer and expiry and return the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[LOCAL_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}
