//! The request auth chain.
//!
//! [`AuthGate::authenticate`] turns request headers into an [`Identity`];
//! [`check_expiry`] and [`authorize`] are pure predicates over that identity.
//! The middleware runs them in that order before routing.

use anyhow::{Context, Result};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use tracing::{debug, info};

use super::basic;
use super::jwks::FederatedVerifier;
use super::token::{Claims, LocalTokens};
use super::AuthError;
use crate::config::{AuthConfig, AuthMode, UserConfig};

/// Authenticated caller, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub scopes: Vec<String>,
    /// `exp` of the presented token, seconds since the epoch.
    pub expires_at: i64,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            scopes: claims.scopes(),
            subject: claims.sub,
            expires_at: claims.exp,
        }
    }
}

pub enum Verifier {
    Disabled,
    Local {
        tokens: LocalTokens,
        users: Vec<UserConfig>,
    },
    Federated(FederatedVerifier),
}

pub struct AuthGate {
    verifier: Verifier,
    required_scope: Option<String>,
    token_ttl_secs: u64,
}

impl AuthGate {
    pub fn new(verifier: Verifier, required_scope: Option<String>, token_ttl_secs: u64) -> Self {
        Self {
            verifier,
            required_scope,
            token_ttl_secs,
        }
    }

    /// Build the gate for the configured mode, loading key material.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let verifier = match config.mode {
            AuthMode::Disabled => Verifier::Disabled,
            AuthMode::Local => {
                let local = config
                    .local
                    .as_ref()
                    .context("auth.local is required when auth.mode is local")?;
                let tokens =
                    LocalTokens::from_pem_files(&local.private_key_path, &local.public_key_path)?;
                info!(users = local.users.len(), "local token signing enabled");
                Verifier::Local {
                    tokens,
                    users: local.users.clone(),
                }
            }
            AuthMode::Federated => {
                let federated = config
                    .federated
                    .as_ref()
                    .context("auth.federated is required when auth.mode is federated")?;
                info!(issuer = %federated.issuer, "federated token validation enabled");
                Verifier::Federated(FederatedVerifier::new(federated)?)
            }
        };
        Ok(Self::new(
            verifier,
            config.required_scope.clone(),
            config.token_ttl_secs,
        ))
    }

    pub fn disabled() -> Self {
        Self::new(Verifier::Disabled, None, 0)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.verifier, Verifier::Disabled)
    }

    pub fn required_scope(&self) -> Option<&str> {
        self.required_scope.as_deref()
    }

    /// Resolve the caller from the `Authorization` header.  `None` when
    /// authentication is disabled.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError> {
        let claims = match &self.verifier {
            Verifier::Disabled => return Ok(None),
            Verifier::Local { tokens, .. } => tokens.verify(bearer_token(headers)?)?,
            Verifier::Federated(verifier) => verifier.verify(bearer_token(headers)?).await?,
        };
        debug!(subject = %claims.sub, "token validated");
        Ok(Some(claims.into()))
    }

    /// The token issuer, present only in local mode.
    pub fn issuer(&self) -> Option<TokenIssuer<'_>> {
        match &self.verifier {
            Verifier::Local { tokens, users } => Some(TokenIssuer {
                tokens,
                users,
                ttl_secs: self.token_ttl_secs,
            }),
            _ => None,
        }
    }
}

/// Mints tokens for users presenting Basic credentials.
pub struct TokenIssuer<'a> {
    tokens: &'a LocalTokens,
    users: &'a [UserConfig],
    ttl_secs: u64,
}

impl TokenIssuer<'_> {
    /// Check the Basic credentials in `headers` against the configured users.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<&UserConfig, AuthError> {
        basic::verify(headers, self.users)
    }

    /// Sign a token for `user` carrying its scopes.
    pub fn issue(&self, user: &UserConfig) -> Result<String> {
        self.tokens.issue(&user.username, &user.scopes, self.ttl_secs)
    }
}

/// Extract the bearer token.  A request without one is `Missing`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers.get(AUTHORIZATION).ok_or(AuthError::Missing)?;
    let value = value
        .to_str()
        .map_err(|_| AuthError::Malformed("Authorization header is not valid ASCII".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AuthError::Missing)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

/// Reject identities whose token expired before `now` (epoch seconds).
pub fn check_expiry(identity: &Identity, now: i64) -> Result<(), AuthError> {
    if identity.expires_at < now {
        return Err(AuthError::Expired);
    }
    Ok(())
}

/// Require `scope`, if one is configured, among the identity's scopes.
pub fn authorize(identity: &Identity, required_scope: Option<&str>) -> Result<(), AuthError> {
    match required_scope {
        Some(scope) if !identity.scopes.iter().any(|s| s == scope) => {
            Err(AuthError::InsufficientScope(scope.to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use chrono::Utc;

    use super::*;
    use crate::auth::token::tests::test_tokens;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn local_gate(required_scope: Option<&str>) -> AuthGate {
        AuthGate::new(
            Verifier::Local {
                tokens: test_tokens(),
                users: vec![UserConfig {
                    username: "ci".into(),
                    password: "secret".into(),
                    password_env: None,
                    scopes: vec!["app".into()],
                }],
            },
            required_scope.map(str::to_string),
            3600,
        )
    }

    fn identity(scopes: &[&str], expires_at: i64) -> Identity {
        Identity {
            subject: "alice".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            expires_at,
        }
    }

    // ── authenticate ──

    #[tokio::test]
    async fn test_disabled_gate_is_anonymous() {
        let gate = AuthGate::disabled();
        assert!(!gate.is_enabled());
        assert_eq!(gate.authenticate(&HeaderMap::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let gate = local_gate(None);
        assert_eq!(
            gate.authenticate(&HeaderMap::new()).await.unwrap_err(),
            AuthError::Missing
        );
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let gate = local_gate(None);
        let token = test_tokens().issue("alice", &["app".into()], 60).unwrap();

        let identity = gate.authenticate(&bearer(&token)).await.unwrap().unwrap();
        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.scopes, vec!["app"]);
    }

    #[tokio::test]
    async fn test_garbage_token_is_rejected() {
        let gate = local_gate(None);
        assert!(matches!(
            gate.authenticate(&bearer("abc.def")).await.unwrap_err(),
            AuthError::Malformed(_)
        ));
    }

    #[test]
    fn test_basic_scheme_is_not_a_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Y2k6c2VjcmV0"));
        assert_eq!(bearer_token(&headers).unwrap_err(), AuthError::Missing);
    }

    // ── check_expiry ──

    #[test]
    fn test_check_expiry() {
        let now = Utc::now().timestamp();
        assert!(check_expiry(&identity(&[], now + 10), now).is_ok());
        assert!(check_expiry(&identity(&[], now), now).is_ok());
        assert_eq!(
            check_expiry(&identity(&[], now - 1), now).unwrap_err(),
            AuthError::Expired
        );
    }

    // ── authorize ──

    #[test]
    fn test_authorize_without_required_scope() {
        assert!(authorize(&identity(&[], 0), None).is_ok());
    }

    #[test]
    fn test_authorize_with_required_scope() {
        assert!(authorize(&identity(&["read", "app"], 0), Some("app")).is_ok());
        assert_eq!(
            authorize(&identity(&["read"], 0), Some("app")).unwrap_err(),
            AuthError::InsufficientScope("app".into())
        );
    }

    // ── issuer ──

    #[test]
    fn test_issue_token_with_basic_credentials() {
        let gate = local_gate(None);
        let mut headers = HeaderMap::new();
        // base64("ci:secret")
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Y2k6c2VjcmV0"));

        let issuer = gate.issuer().unwrap();
        let user = issuer.authenticate(&headers).unwrap();
        let token = issuer.issue(user).unwrap();
        let claims = test_tokens().verify(&token).unwrap();
        assert_eq!(claims.sub, "ci");
        assert_eq!(claims.scope, "app");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_issuer_absent_when_disabled() {
        assert!(AuthGate::disabled().issuer().is_none());
    }
}
