//! Origin repository access.
//!
//! Provides the [`Upstream`] trait that the artifact cache dispatches through,
//! and [`RemoteFetcher`], the HTTP implementation that talks to the configured
//! origin.  Keeping the cache behind a trait lets it be exercised without a
//! network.

pub mod http;

use std::fmt;

use bytes::Bytes;

pub use http::{OriginCredentials, RemoteFetcher};

/// Artifact bytes together with the content type resolved for their path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub content: Bytes,
    pub content_type: String,
}

/// Transport-level failure class, kept apart from origin statuses so callers
/// can decide on retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connection,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Connection => f.write_str("connection"),
        }
    }
}

/// Why an origin fetch did not yield an artifact.
///
/// `Clone` so that one outcome can be handed to every caller waiting on the
/// same in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("artifact not found at origin")]
    NotFound,

    #[error("origin returned status {status}")]
    Status { status: u16 },

    #[error("unusable redirect from origin (status {status}): {reason}")]
    Redirect { status: u16, reason: String },

    #[error("network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("origin fetch did not complete: {0}")]
    Incomplete(String),
}

/// Abstraction over the origin the cache fills itself from.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch the artifact at `path` (leading `/`, relative to the origin base).
    async fn fetch(&self, path: &str) -> Result<Fetched, FetchError>;

    /// Reachability probe for the health endpoint.
    async fn check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
