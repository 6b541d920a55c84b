//! Read-through artifact cache.
//!
//! A lookup is answered from the [`ArtifactStore`] when possible.  On a miss
//! the artifact is fetched from the origin, written back to the store and
//! returned.  Concurrent misses for the same path share one origin fetch.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, instrument, warn};

use super::flight::FlightGroup;
use crate::metrics::{FetchOutcome, Metrics};
use crate::storage::{Artifact, ArtifactStore};
use crate::upstream::{FetchError, Fetched, Upstream};

/// A fetched artifact that could not be persisted.  Never surfaced to
/// callers; the content is still served.
#[derive(Debug, thiserror::Error)]
#[error("failed to cache artifact at {path}: {reason}")]
pub struct CacheWriteError {
    pub path: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// ArtifactCache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn ArtifactStore>,
    upstream: Arc<dyn Upstream>,
    flights: FlightGroup,
    metrics: Arc<Metrics>,
}

impl ArtifactCache {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        upstream: Arc<dyn Upstream>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            upstream,
            flights: FlightGroup::new(),
            metrics,
        }
    }

    /// Return the artifact at `path`, filling the store from the origin on a
    /// miss.
    #[instrument(skip(self), fields(%path))]
    pub async fn get(&self, path: &str) -> Result<Fetched, FetchError> {
        if let Some(hit) = lookup(self.store.as_ref(), path).await {
            debug!("cache hit");
            self.metrics.cache_hits.inc();
            return Ok(hit);
        }
        self.metrics.cache_misses.inc();

        let store = self.store.clone();
        let upstream = self.upstream.clone();
        let metrics = self.metrics.clone();
        let owned = path.to_string();
        self.flights
            .run(path, move || fill(store, upstream, metrics, owned).boxed())
            .await
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }
}

/// Store lookup that fails open: a read error is logged and reported as a
/// miss so the origin can still serve the request.
async fn lookup(store: &dyn ArtifactStore, path: &str) -> Option<Fetched> {
    match store.get(path).await {
        Ok(Some(artifact)) => Some(Fetched {
            content: artifact.content,
            content_type: artifact.content_type,
        }),
        Ok(None) => None,
        Err(e) => {
            warn!(%path, error = %format!("{e:#}"), "store read failed, falling through to origin");
            None
        }
    }
}

/// Body of a flight: re-check the store, fetch, write back.
async fn fill(
    store: Arc<dyn ArtifactStore>,
    upstream: Arc<dyn Upstream>,
    metrics: Arc<Metrics>,
    path: String,
) -> Result<Fetched, FetchError> {
    // A flight that finished just before this one started may have
    // written the artifact already.
    if let Some(hit) = lookup(store.as_ref(), &path).await {
        debug!(%path, "filled by an earlier fetch");
        return Ok(hit);
    }

    let fetched = match upstream.fetch(&path).await {
        Ok(fetched) => {
            metrics.record_fetch(FetchOutcome::Success);
            fetched
        }
        Err(FetchError::NotFound) => {
            metrics.record_fetch(FetchOutcome::NotFound);
            return Err(FetchError::NotFound);
        }
        Err(e) => {
            metrics.record_fetch(FetchOutcome::Error);
            return Err(e);
        }
    };

    let artifact = Artifact::new(
        path.clone(),
        fetched.content.clone(),
        fetched.content_type.clone(),
    );
    match store.upsert(artifact).await {
        Ok(()) => debug!(%path, bytes = fetched.content.len(), "artifact cached"),
        Err(e) => {
            metrics.cache_write_errors.inc();
            let err = CacheWriteError {
                path,
                reason: format!("{e:#}"),
            };
            warn!(error = %err, "serving artifact without caching it");
        }
    }
    Ok(fetched)
}
