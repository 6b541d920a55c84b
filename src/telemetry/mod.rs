//! Access and credential telemetry.
//!
//! - [`access`]: per-(user, path) request counter, fed through a bounded
//!   queue so request handlers never wait on metrics.
//! - [`expiry`]: seconds until the origin password (a JWT) expires, read
//!   without verifying its signature.

pub mod access;
pub mod expiry;

pub use access::AccessRecorder;
pub use expiry::ExpiryProbe;
