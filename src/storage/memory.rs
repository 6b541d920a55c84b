use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use super::{artifact_id, Artifact, ArtifactStore};

/// In-process artifact store keyed by the derived artifact id.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<Uuid, Artifact>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Artifact>> {
        let records = self.records.read().await;
        Ok(records.get(&artifact_id(path)).cloned())
    }

    async fn upsert(&self, artifact: Artifact) -> Result<()> {
        trace!(path = %artifact.path, id = %artifact.id, "memory store upsert");
        self.records.write().await.insert(artifact.id, artifact);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
