//! KeyDB (Redis-compatible) artifact store.
//!
//! Each artifact is one hash at `{prefix}artifact:{id}` holding the path,
//! base64-encoded content, content type and RFC 3339 modification time.
//! Because the key is derived from the path, an HSET for an existing path
//! overwrites the previous record in place.

use std::collections::HashMap;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, HashesInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, TlsConnector};
use fred::types::Builder;
use tracing::{debug, info, trace, warn};

use super::{artifact_id, Artifact, ArtifactStore};
use crate::config::KeyDbConfig;

const POOL_SIZE: usize = 4;

#[derive(Clone)]
pub struct KeyDbStore {
    pool: Pool,
    key_prefix: String,
}

impl KeyDbStore {
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
        }
    }

    /// Open a connection pool for the store and check that KeyDB answers
    /// before any artifact is served from it.
    pub async fn connect(config: &KeyDbConfig) -> Result<Self> {
        let auth_token = std::env::var(&config.auth_token_env).ok();
        let mut builder = Builder::from_config(connection_config(config, auth_token)?);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

        let pool = builder
            .build_pool(POOL_SIZE)
            .context("failed to build KeyDB pool for the artifact store")?;
        pool.init()
            .await
            .context("failed to connect the artifact store to KeyDB")?;

        let store = Self::new(pool, config.key_prefix.clone());
        store.ping().await?;
        info!(
            tls = config.tls,
            key_prefix = %config.key_prefix,
            pool_size = POOL_SIZE,
            "artifact store connected to KeyDB"
        );
        Ok(store)
    }

    fn record_key(&self, path: &str) -> String {
        format!("{}artifact:{}", self.key_prefix, artifact_id(path))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for KeyDbStore {
    async fn get(&self, path: &str) -> Result<Option<Artifact>> {
        let key = self.record_key(path);
        let map: HashMap<String, String> = self
            .pool
            .hgetall(&key)
            .await
            .context("HGETALL artifact")?;
        if map.is_empty() {
            trace!(%path, "artifact not in KeyDB");
            return Ok(None);
        }
        let artifact = artifact_from_map(map)?;
        if artifact.path != path {
            warn!(%path, stored = %artifact.path, "artifact id collision, ignoring record");
            return Ok(None);
        }
        Ok(Some(artifact))
    }

    async fn upsert(&self, artifact: Artifact) -> Result<()> {
        let key = self.record_key(&artifact.path);
        let pairs = artifact_to_pairs(&artifact);
        let _: () = self.pool.hset(&key, pairs).await.context("HSET artifact")?;
        debug!(path = %artifact.path, %key, "artifact written to KeyDB");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await.context("KeyDB PING failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Artifact <-> flat hash
// ---------------------------------------------------------------------------

fn artifact_to_pairs(artifact: &Artifact) -> Vec<(String, String)> {
    vec![
        ("id".into(), artifact.id.to_string()),
        ("path".into(), artifact.path.clone()),
        ("content".into(), STANDARD.encode(&artifact.content)),
        ("content_type".into(), artifact.content_type.clone()),
        ("last_modified".into(), artifact.last_modified.to_rfc3339()),
    ]
}

fn artifact_from_map(map: HashMap<String, String>) -> Result<Artifact> {
    let field = |name: &str| {
        map.get(name)
            .cloned()
            .with_context(|| format!("artifact hash is missing field `{name}`"))
    };
    let path = field("path")?;
    let content = STANDARD
        .decode(field("content")?)
        .context("artifact content is not valid base64")?;
    let last_modified = DateTime::parse_from_rfc3339(&field("last_modified")?)
        .context("artifact last_modified is not RFC 3339")?
        .with_timezone(&Utc);
    Ok(Artifact {
        id: artifact_id(&path),
        path,
        content: Bytes::from(content),
        content_type: field("content_type")?,
        last_modified,
    })
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// The configured endpoint as a `redis://` or `rediss://` URL.  A bare
/// `host:port` gets the scheme implied by `tls`.
fn endpoint_url(config: &KeyDbConfig) -> String {
    if config.endpoint.contains("://") {
        return config.endpoint.clone();
    }
    let scheme = if config.tls { "rediss" } else { "redis" };
    format!("{scheme}://{}", config.endpoint)
}

/// Client settings for the store: server and database from the endpoint URL,
/// password from the auth token when one is set.
fn connection_config(config: &KeyDbConfig, auth_token: Option<String>) -> Result<FredConfig> {
    let url = endpoint_url(config);
    let mut fred_config = FredConfig::from_url(&url)
        .with_context(|| format!("invalid KeyDB endpoint `{}`", config.endpoint))?;

    if config.tls || url.starts_with("rediss://") {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
        fred_config.password = Some(token);
    }
    Ok(fred_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    use fred::types::config::ServerConfig;

    fn keydb_config(endpoint: &str, tls: bool) -> KeyDbConfig {
        KeyDbConfig {
            endpoint: endpoint.to_string(),
            tls,
            auth_token_env: "MAVENCACHE_TEST_KEYDB_TOKEN".to_string(),
            key_prefix: "test:".to_string(),
        }
    }

    fn server_of(config: &FredConfig) -> (String, u16) {
        match &config.server {
            ServerConfig::Centralized { server } => (server.host.to_string(), server.port),
            _ => panic!("expected a centralized server"),
        }
    }

    #[test]
    fn test_bare_endpoint_gets_scheme_from_tls_flag() {
        assert_eq!(endpoint_url(&keydb_config("keydb.local:6380", false)), "redis://keydb.local:6380");
        assert_eq!(endpoint_url(&keydb_config("keydb.local:6380", true)), "rediss://keydb.local:6380");
        assert_eq!(
            endpoint_url(&keydb_config("redis://keydb.local", true)),
            "redis://keydb.local"
        );
    }

    #[test]
    fn test_connection_config_reads_host_port_and_database() {
        let fred_config = connection_config(&keydb_config("keydb.local:6380/2", false), None).unwrap();
        assert_eq!(server_of(&fred_config), ("keydb.local".to_string(), 6380));
        assert_eq!(fred_config.database, Some(2));
        assert!(fred_config.password.is_none());
    }

    #[test]
    fn test_connection_config_default_port() {
        let fred_config = connection_config(&keydb_config("redis://keydb.local", false), None).unwrap();
        assert_eq!(server_of(&fred_config), ("keydb.local".to_string(), 6379));
    }

    #[test]
    fn test_auth_token_becomes_password() {
        let config = keydb_config("keydb.local:6379", false);
        let fred_config = connection_config(&config, Some("tok".into())).unwrap();
        assert_eq!(fred_config.password.as_deref(), Some("tok"));

        let fred_config = connection_config(&config, Some(String::new())).unwrap();
        assert!(fred_config.password.is_none());
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        assert!(connection_config(&keydb_config("keydb.local:notaport", false), None).is_err());
    }

    /// Runs against a live server: `MAVENCACHE_TEST_KEYDB=host:port cargo test -- --ignored`.
    #[tokio::test]
    #[ignore = "requires a KeyDB server"]
    async fn test_get_and_upsert_round_trip() {
        let endpoint =
            std::env::var("MAVENCACHE_TEST_KEYDB").unwrap_or_else(|_| "127.0.0.1:6379".into());
        let mut config = keydb_config(&endpoint, false);
        config.key_prefix = format!("mavencache-test:{}:", Utc::now().timestamp_micros());
        let store = KeyDbStore::connect(&config).await.unwrap();

        let path = "/g/a/1.0/a-1.0.jar";
        assert!(store.get(path).await.unwrap().is_none());

        store
            .upsert(Artifact::new(path, Bytes::from_static(b"\x00one"), "application/octet-stream"))
            .await
            .unwrap();
        store
            .upsert(Artifact::new(path, Bytes::from_static(b"\x00two"), "application/octet-stream"))
            .await
            .unwrap();

        let stored = store.get(path).await.unwrap().unwrap();
        assert_eq!(stored.id, artifact_id(path));
        assert_eq!(stored.content.as_ref(), b"\x00two");
        assert!(store.get("/g/a/1.0/a-1.0.pom").await.unwrap().is_none());
    }

    #[test]
    fn test_hash_mapping_preserves_binary_content() {
        let artifact = Artifact::new(
            "/g/a/1.0/a-1.0.jar",
            Bytes::from_static(&[0x50, 0x4b, 0x03, 0x04, 0x00, 0xff]),
            "application/octet-stream",
        );
        let map: HashMap<String, String> = artifact_to_pairs(&artifact).into_iter().collect();
        let back = artifact_from_map(map).unwrap();

        assert_eq!(back.id, artifact.id);
        assert_eq!(back.content, artifact.content);
        assert_eq!(back.content_type, artifact.content_type);
        assert_eq!(back.last_modified, artifact.last_modified);
    }

    #[test]
    fn test_hash_missing_field_is_error() {
        let mut map = HashMap::new();
        map.insert("path".to_string(), "/g/a.jar".to_string());
        let err = artifact_from_map(map).unwrap_err();
        assert!(err.to_string().contains("content"));
    }
}
