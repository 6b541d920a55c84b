//! Main axum router and HTTP request handlers for the Maven caching proxy.
//!
//! Routes:
//! - `GET {prefix}/{*path}` - Artifact download (auth chain applies)
//! - `GET /token`           - Mint a token from Basic credentials (local auth only)
//! - `GET /healthz`         - Health check
//! - `GET /metrics`         - Prometheus metrics (when enabled)

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, Extensions, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info, instrument, warn};

use crate::auth::{AuthError, Identity};
use crate::upstream::{FetchError, NetworkErrorKind};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let artifacts = Router::new()
        .route(
            &artifact_route(&state.config.proxy.path_prefix),
            get(handle_artifact),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::auth::middleware::require_auth,
        ));

    let mut router = Router::new().route("/healthz", get(crate::health::health_handler));
    if state.auth.issuer().is_some() {
        router = router.route("/token", get(handle_token));
    }
    if state.config.metrics.enabled {
        router = router.route("/metrics", get(handle_metrics));
    }

    router.merge(artifacts).with_state(state)
}

fn artifact_route(prefix: &str) -> String {
    format!("{}/{{*path}}", prefix.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET {prefix}/{*path}`
///
/// Serves the artifact from the cache, filling it from the origin on a miss.
#[instrument(skip_all, fields(path = %rest))]
async fn handle_artifact(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    extensions: Extensions,
) -> Result<Response, AppError> {
    let path = format!("/{rest}");
    if path.split('/').any(|segment| segment == "..") {
        return Err(AppError::BadRequest("path traversal is not allowed".into()));
    }

    if let Some(identity) = extensions.get::<Identity>() {
        state.access.record(&identity.subject, &path);
    }

    let fetched = state.cache.get(&path).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, fetched.content_type)],
        fetched.content,
    )
        .into_response())
}

/// `GET /token`
///
/// Exchanges HTTP Basic credentials for a signed bearer token.
#[instrument(skip_all)]
async fn handle_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some(issuer) = state.auth.issuer() else {
        return Err(AppError::NotFound);
    };
    let user = issuer.authenticate(&headers).map_err(|e| {
        warn!(error = %e, "token request rejected");
        AppError::BasicUnauthorized(e)
    })?;
    let token = issuer.issue(user)?;
    info!(user = %user.username, "token issued");

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        token,
    )
        .into_response())
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.  The origin credential
/// gauge is recomputed on every scrape.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    state.expiry.refresh();
    let buf = state.metrics.encode()?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Bearer authentication failed.
    Unauthorized(AuthError),
    /// Basic authentication on `/token` failed.
    BasicUnauthorized(AuthError),
    /// Authenticated, but missing the required scope.
    Forbidden(AuthError),
    BadRequest(String),
    NotFound,
    /// The origin could not supply the artifact.
    Fetch(FetchError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(err) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                err.to_string(),
            )
                .into_response(),
            AppError::BasicUnauthorized(err) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"mavencache\"")],
                err.to_string(),
            )
                .into_response(),
            AppError::Forbidden(err) => (StatusCode::FORBIDDEN, err.to_string()).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound => StatusCode::NOT_FOUND.into_response(),
            AppError::Fetch(err) => {
                let status = fetch_error_status(&err);
                if status.is_server_error() {
                    warn!(error = %err, %status, "origin fetch failed");
                }
                (status, err.to_string()).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

/// Origin error statuses are mirrored; everything without a usable status is
/// a gateway error.
fn fetch_error_status(err: &FetchError) -> StatusCode {
    match err {
        FetchError::NotFound => StatusCode::NOT_FOUND,
        FetchError::Status { status } if *status >= 400 => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        FetchError::Network {
            kind: NetworkErrorKind::Timeout,
            ..
        } => StatusCode::GATEWAY_TIMEOUT,
        FetchError::Status { .. }
        | FetchError::Redirect { .. }
        | FetchError::Network { .. }
        | FetchError::Incomplete(_) => StatusCode::BAD_GATEWAY,
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InsufficientScope(_) => AppError::Forbidden(err),
            _ => AppError::Unauthorized(err),
        }
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        AppError::Fetch(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
