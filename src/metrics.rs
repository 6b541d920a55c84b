use std::sync::Arc;

use anyhow::Result;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AccessLabels {
    pub user: String,
    pub path: String,
}

/// Which credential a token gauge sample describes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CredentialLabels {
    pub source: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchOutcome {
    Success,
    NotFound,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub outcome: FetchOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- access --
    pub user_access: Family<AccessLabels, Counter>,

    // -- origin credential --
    /// Only carries a sample while the credential's `exp` is known.
    pub credential_seconds_until_expiration: Family<CredentialLabels, Gauge>,

    // -- cache --
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_write_errors: Counter,
    pub upstream_fetches: Family<FetchLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let user_access = Family::<AccessLabels, Counter>::default();
        registry.register(
            "mavencache_user_access",
            "Artifact requests by authenticated user and path",
            user_access.clone(),
        );

        let credential_seconds_until_expiration = Family::<CredentialLabels, Gauge>::default();
        registry.register(
            "mavencache_origin_credential_seconds_until_expiration",
            "Seconds until the origin password token expires (negative once expired)",
            credential_seconds_until_expiration.clone(),
        );

        let cache_hits = Counter::default();
        registry.register(
            "mavencache_cache_hits",
            "Artifact requests served from the store",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "mavencache_cache_misses",
            "Artifact requests that missed the store",
            cache_misses.clone(),
        );

        let cache_write_errors = Counter::default();
        registry.register(
            "mavencache_cache_write_errors",
            "Fetched artifacts that could not be written to the store",
            cache_write_errors.clone(),
        );

        let upstream_fetches = Family::<FetchLabels, Counter>::default();
        registry.register(
            "mavencache_upstream_fetch",
            "Origin fetches by outcome",
            upstream_fetches.clone(),
        );

        Self {
            user_access,
            credential_seconds_until_expiration,
            cache_hits,
            cache_misses,
            cache_write_errors,
            upstream_fetches,
        }
    }

    pub fn record_fetch(&self, outcome: FetchOutcome) {
        self.upstream_fetches
            .get_or_create(&FetchLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
