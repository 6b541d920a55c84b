//! HTTP Basic verification against the configured token users.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;

use super::AuthError;
use crate::config::UserConfig;

/// Decode `Authorization: Basic ...` into `(username, password)`.
pub fn credentials(headers: &HeaderMap) -> Result<(String, String), AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed("Authorization header is not valid ASCII".into()))?;
    let encoded = value
        .strip_prefix("Basic ")
        .ok_or(AuthError::Missing)?
        .trim();
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::Malformed("Basic credentials are not valid base64".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthError::Malformed("Basic credentials are not UTF-8".into()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| AuthError::Malformed("Basic credentials lack a ':'".into()))?;
    Ok((username.to_string(), password.to_string()))
}

/// Find the user matching the Basic credentials in `headers`.
pub fn verify<'a>(headers: &HeaderMap, users: &'a [UserConfig]) -> Result<&'a UserConfig, AuthError> {
    let (username, password) = credentials(headers)?;
    users
        .iter()
        .find(|u| u.username == username)
        .filter(|u| bool::from(u.password.as_bytes().ct_eq(password.as_bytes())))
        .ok_or(AuthError::InvalidClaims("bad username or password".into()))
}
