//! Artifact persistence.
//!
//! The cache only talks to the [`ArtifactStore`] trait.  Two backends are
//! provided: an in-process map for single-node deployments and tests, and a
//! KeyDB-backed store that survives restarts and can be shared by several
//! proxy nodes.

pub mod keydb;
pub mod memory;

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use keydb::KeyDbStore;
pub use memory::MemoryStore;

/// A cached artifact as persisted by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Derived from `path`, see [`artifact_id`].
    pub id: Uuid,
    /// Repository-relative path with a leading `/`.
    pub path: String,
    pub content: Bytes,
    pub content_type: String,
    /// Time of the write that produced `content`.
    pub last_modified: DateTime<Utc>,
}

impl Artifact {
    /// Build a record for `path` stamped with the current time.
    pub fn new(path: impl Into<String>, content: Bytes, content_type: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            id: artifact_id(&path),
            path,
            content,
            content_type: content_type.into(),
            last_modified: Utc::now(),
        }
    }
}

/// Deterministic record id for an artifact path.
///
/// Independent writers of the same path always compute the same id, so
/// concurrent first writes collapse onto a single record.
pub fn artifact_id(path: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, path.as_bytes())
}

/// Repository interface over the artifact table.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Look up the artifact stored for `path`.
    async fn get(&self, path: &str) -> Result<Option<Artifact>>;

    /// Insert `artifact`, replacing any record with the same id.
    async fn upsert(&self, artifact: Artifact) -> Result<()>;

    /// Cheap reachability probe used by the health endpoint.
    async fn ping(&self) -> Result<()>;
}
