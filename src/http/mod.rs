//! HTTP layer for the Maven caching proxy.
//!
//! This module provides the axum router that serves artifacts through the
//! read-through cache behind the auth chain, mints local tokens, and exposes
//! health and metrics endpoints.

pub mod handler;
