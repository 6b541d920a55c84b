//! Authentication and authorisation subsystem.
//!
//! Bearer tokens are RS256 JWTs, either minted by this service from a local
//! key pair (`/token`) or issued by an external OIDC provider and verified
//! against its JWKS.  Each request passes an ordered chain of checks:
//! authenticate, check expiry, authorize.

pub mod basic;
pub mod gate;
pub mod jwks;
pub mod middleware;
pub mod token;

pub use gate::{AuthGate, Identity};

/// Why a request was refused by the auth chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token has expired")]
    Expired,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("invalid token claims: {0}")]
    InvalidClaims(String),

    #[error("no usable signing key: {0}")]
    KeyUnavailable(String),

    #[error("required scope `{0}` not granted")]
    InsufficientScope(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature
            | ErrorKind::MissingRequiredClaim(_) => Self::InvalidClaims(err.to_string()),
            _ => Self::Malformed(err.to_string()),
        }
    }
}
