//! Artifact caching for the Maven proxy.
//!
//! Provides an [`ArtifactCache`] that serves artifacts from the configured
//! store and fills it from the origin on a miss, with per-path single-flight
//! so concurrent misses cost one origin request.

pub mod flight;
pub mod manager;

pub use manager::ArtifactCache;
