//! axum middleware running the auth chain in front of artifact routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use tracing::{debug, warn};

use super::gate::{authorize, check_expiry};
use crate::http::handler::AppError;
use crate::AppState;

/// authenticate, then check expiry, then authorize.  On success the
/// [`Identity`](super::Identity) is inserted into the request extensions.
/// With authentication disabled the request passes through untouched.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identity = match state.auth.authenticate(request.headers()).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return Ok(next.run(request).await),
        Err(e) => {
            debug!(error = %e, path = %request.uri().path(), "authentication failed");
            return Err(e.into());
        }
    };

    check_expiry(&identity, Utc::now().timestamp())?;

    if let Err(e) = authorize(&identity, state.auth.required_scope()) {
        warn!(subject = %identity.subject, error = %e, "request not authorized");
        return Err(e.into());
    }

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
