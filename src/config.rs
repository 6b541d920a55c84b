use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub origin: OriginConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ---------------------------------------------------------------------------
// Origin repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    /// Base URL of the remote repository (e.g. `https://repo.example.com/maven2`).
    /// Artifact paths are appended verbatim.
    pub base_url: String,
    /// Username for Basic authentication against the origin.  Credentials are
    /// only sent when both the username and the password are available.
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the environment variable that holds the origin password.
    ///
    /// The password is frequently a JWT issued by the repository vendor; its
    /// `exp` claim feeds the credential expiration gauge.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Per-hop timeout for origin requests, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_password_env() -> String {
    "ORIGIN_REPO_PASSWORD".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    "mavencache/0.1".to_string()
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Route prefix under which artifacts are served.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            path_prefix: default_path_prefix(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path_prefix() -> String {
    "/maven".to_string()
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// How inbound requests are authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication; every request is anonymous.
    #[default]
    Disabled,
    /// Tokens are issued and verified with a locally held RSA key pair.
    Local,
    /// Tokens are issued by an external OIDC provider and verified via JWKS.
    Federated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Lifetime of tokens minted by `/token`, in seconds (default 180 days).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Scope every artifact request must carry.  Unset means any
    /// authenticated caller is allowed.
    #[serde(default)]
    pub required_scope: Option<String>,
    #[serde(default)]
    pub local: Option<LocalAuthConfig>,
    #[serde(default)]
    pub federated: Option<FederatedAuthConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            token_ttl_secs: default_token_ttl(),
            required_scope: None,
            local: None,
            federated: None,
        }
    }
}

fn default_token_ttl() -> u64 {
    15_552_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalAuthConfig {
    /// PKCS#8 PEM file with the RSA private key used to sign tokens.
    pub private_key_path: String,
    /// SPKI PEM file with the matching RSA public key.
    pub public_key_path: String,
    /// Users allowed to mint tokens through `GET /token`.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Inline password.  Filled from `password_env` at load time when that is set.
    #[serde(default)]
    pub password: String,
    /// Name of the environment variable that holds the password.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Authorities granted to this user; joined with spaces into the `scope` claim.
    #[serde(default = "default_user_scopes")]
    pub scopes: Vec<String>,
}

fn default_user_scopes() -> Vec<String> {
    vec!["app".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederatedAuthConfig {
    /// Expected `iss` claim, also the base for OIDC discovery.
    pub issuer: String,
    /// Explicit JWKS endpoint.  Discovered from the issuer when omitted.
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Expected `aud` claim, if any.
    #[serde(default)]
    pub audience: Option<String>,
    /// How long fetched signing keys are trusted before a refresh, in seconds.
    #[serde(default = "default_jwks_cache_ttl")]
    pub jwks_cache_ttl_secs: u64,
}

fn default_jwks_cache_ttl() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Expose `/metrics` and record per-user access counters.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Capacity of the queue between request handlers and the access recorder.
    #[serde(default = "default_access_queue_capacity")]
    pub access_queue_capacity: usize,
    /// When set, the encoded metrics are also written to the log at this
    /// interval (seconds).
    #[serde(default)]
    pub log_interval_secs: Option<u64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_queue_capacity: default_access_queue_capacity(),
            log_interval_secs: None,
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_access_queue_capacity() -> usize {
    1024
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Keydb,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    /// Prefix for every key written by the artifact store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_key_prefix() -> String {
    "mavencache:".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    resolve_user_passwords(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Replace each token user's password with the value of its `password_env`
/// variable.
fn resolve_user_passwords<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(local) = config.auth.local.as_mut() else {
        return Ok(());
    };
    for user in &mut local.users {
        let Some(name) = user.password_env.as_deref() else {
            continue;
        };
        anyhow::ensure!(
            user.password.is_empty(),
            "auth.local user `{}` sets both password and password_env",
            user.username
        );
        user.password = lookup(name)
            .filter(|v| !v.is_empty())
            .with_context(|| {
                format!(
                    "environment variable `{name}` for auth.local user `{}` is unset",
                    user.username
                )
            })?;
    }
    Ok(())
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let base = reqwest::Url::parse(&config.origin.base_url)
        .with_context(|| format!("invalid origin.base_url: {}", config.origin.base_url))?;
    anyhow::ensure!(
        matches!(base.scheme(), "http" | "https"),
        "origin.base_url must use http or https"
    );
    anyhow::ensure!(
        config.origin.request_timeout_secs > 0,
        "origin.request_timeout_secs must be positive"
    );
    anyhow::ensure!(
        config.proxy.path_prefix.starts_with('/'),
        "proxy.path_prefix must start with '/'"
    );
    anyhow::ensure!(
        config.metrics.access_queue_capacity > 0,
        "metrics.access_queue_capacity must be positive"
    );
    match config.auth.mode {
        AuthMode::Disabled => {}
        AuthMode::Local => {
            let local = config
                .auth
                .local
                .as_ref()
                .context("auth.local is required when auth.mode is local")?;
            for user in &local.users {
                anyhow::ensure!(
                    !user.password.is_empty(),
                    "auth.local user `{}` has no password",
                    user.username
                );
            }
        }
        AuthMode::Federated => anyhow::ensure!(
            config.auth.federated.is_some(),
            "auth.federated is required when auth.mode is federated"
        ),
    }
    if config.storage.backend == StorageBackend::Keydb {
        anyhow::ensure!(
            config.storage.keydb.is_some(),
            "storage.keydb is required when storage.backend is keydb"
        );
    }
    Ok(())
}
