//! Verification of tokens issued by an external OIDC provider.
//!
//! The signing keys are read from the provider's JWKS endpoint, either
//! configured explicitly or discovered from
//! `{issuer}/.well-known/openid-configuration`.  Keys are cached for a fixed
//! TTL and refetched early when a token names a `kid` the cache does not
//! know, so provider key rotation is picked up without a restart.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde::Deserialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, instrument, warn};

use super::token::Claims;
use super::AuthError;
use crate::config::FederatedAuthConfig;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

pub struct FederatedVerifier {
    http_client: reqwest::Client,
    issuer: String,
    audience: Option<String>,
    configured_jwks_uri: Option<String>,
    jwks_uri: OnceCell<String>,
    cache: RwLock<Option<CachedKeys>>,
    ttl: Duration,
    refresh_cooldown: Duration,
}

impl FederatedVerifier {
    pub fn new(config: &FederatedAuthConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build JWKS HTTP client")?;
        Ok(Self {
            http_client,
            issuer: config.issuer.trim_end_matches('/').to_string(),
            audience: config.audience.clone(),
            configured_jwks_uri: config.jwks_uri.clone(),
            jwks_uri: OnceCell::new(),
            cache: RwLock::new(None),
            ttl: Duration::from_secs(config.jwks_cache_ttl_secs),
            refresh_cooldown: DEFAULT_REFRESH_COOLDOWN,
        })
    }

    /// Minimum age of the cached key set before an unknown `kid` triggers a
    /// refetch.
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    /// Validate `token` and return its claims.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header = jsonwebtoken::decode_header(token)?;

        match header.kid.as_deref() {
            Some(kid) => {
                let jwk = self.key_by_id(kid).await?;
                self.decode_with(token, &header, &jwk)
            }
            None => {
                let keys = self.keys(false).await?;
                let mut last_err = AuthError::KeyUnavailable("no signing keys published".into());
                for jwk in keys.keys.iter().filter(|k| is_signing_key(k)) {
                    match self.decode_with(token, &header, jwk) {
                        Ok(claims) => return Ok(claims),
                        Err(AuthError::InvalidSignature) | Err(AuthError::Malformed(_)) => {
                            last_err = AuthError::InvalidSignature;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(last_err)
            }
        }
    }

    fn decode_with(&self, token: &str, header: &Header, jwk: &Jwk) -> Result<Claims, AuthError> {
        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| AuthError::KeyUnavailable(format!("unusable JWK: {e}")))?;
        let alg = jwk_algorithm(jwk).unwrap_or(header.alg);

        let mut validation = Validation::new(alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud.as_str()]),
            None => validation.validate_aud = false,
        }

        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)?;
        Ok(data.claims)
    }

    async fn key_by_id(&self, kid: &str) -> Result<Jwk, AuthError> {
        let keys = self.keys(false).await?;
        if let Some(jwk) = find_key(&keys, kid) {
            return Ok(jwk);
        }

        let stale = self
            .cache
            .read()
            .await
            .as_ref()
            .map_or(true, |c| c.fetched_at.elapsed() >= self.refresh_cooldown);
        if !stale {
            return Err(AuthError::KeyUnavailable(format!("unknown kid `{kid}`")));
        }

        debug!(kid, "unknown kid, refetching JWKS");
        let keys = self.keys(true).await?;
        find_key(&keys, kid).ok_or_else(|| AuthError::KeyUnavailable(format!("unknown kid `{kid}`")))
    }

    /// Current key set, fetched when absent, expired or `force`d.
    async fn keys(&self, force: bool) -> Result<JwkSet, AuthError> {
        if !force {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let uri = self.jwks_uri().await?;
        let keys = self.fetch_keys(uri).await?;
        *self.cache.write().await = Some(CachedKeys {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }

    async fn fetch_keys(&self, uri: &str) -> Result<JwkSet, AuthError> {
        debug!(%uri, "fetching JWKS");
        let response = self
            .http_client
            .get(uri)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(%uri, error = %e, "JWKS fetch failed");
                AuthError::KeyUnavailable(format!("JWKS fetch failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(AuthError::KeyUnavailable(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }
        let keys: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::KeyUnavailable(format!("invalid JWKS document: {e}")))?;
        debug!(%uri, keys = keys.keys.len(), "JWKS cached");
        Ok(keys)
    }

    async fn jwks_uri(&self) -> Result<&String, AuthError> {
        self.jwks_uri
            .get_or_try_init(|| async {
                match &self.configured_jwks_uri {
                    Some(uri) => Ok(uri.clone()),
                    None => self.discover().await,
                }
            })
            .await
    }

    async fn discover(&self) -> Result<String, AuthError> {
        let url = format!("{}{}", self.issuer, DISCOVERY_PATH);
        debug!(%url, "discovering provider metadata");
        let unavailable = AuthError::KeyUnavailable;

        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| unavailable(format!("discovery request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "discovery endpoint returned {}",
                response.status()
            )));
        }
        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| unavailable(format!("invalid discovery document: {e}")))?;

        if metadata.issuer.trim_end_matches('/') != self.issuer {
            return Err(unavailable(format!(
                "discovery issuer mismatch: expected {}, got {}",
                self.issuer, metadata.issuer
            )));
        }
        Ok(metadata.jwks_uri)
    }
}

fn find_key(keys: &JwkSet, kid: &str) -> Option<Jwk> {
    keys.keys
        .iter()
        .filter(|k| is_signing_key(k))
        .find(|k| k.common.key_id.as_deref() == Some(kid))
        .cloned()
}

fn is_signing_key(jwk: &Jwk) -> bool {
    !matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption))
}

fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}
