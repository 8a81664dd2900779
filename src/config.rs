use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cache::BackendKind;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub cache: CachesConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Public base URL this service is reachable at.  Used for the `url`
    /// field of generated manifests; when unset it is derived from the
    /// request's `Host` header.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_url: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// GitHub REST API root.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Root for raw file contents at a given ref.
    #[serde(default = "default_raw_url")]
    pub raw_url: String,
    /// Name of the environment variable that holds the API token.  Without
    /// a token the public (unauthenticated) API is used.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Minimum number of API calls to keep in reserve before refusing
    /// further upstream requests.
    #[serde(default = "default_rate_limit_buffer")]
    pub rate_limit_buffer: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            raw_url: default_raw_url(),
            token_env: default_token_env(),
            rate_limit_buffer: default_rate_limit_buffer(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_token_env() -> String {
    "GH_API_TOKEN".to_string()
}

fn default_rate_limit_buffer() -> u32 {
    10
}

// ---------------------------------------------------------------------------
// Manifest generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestConfig {
    /// Prefix of generated repository ids: `{prefix}.{owner}.{repo}`.
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
    /// Where the package manifest lives inside each tagged tree.
    #[serde(default = "default_package_manifest_path")]
    pub package_manifest_path: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            id_prefix: default_id_prefix(),
            package_manifest_path: default_package_manifest_path(),
        }
    }
}

fn default_id_prefix() -> String {
    "net.ts7m.vpmpkg".to_string()
}

fn default_package_manifest_path() -> String {
    "/package.json".to_string()
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CachesConfig {
    /// Seconds between background sweeps of expired entries.
    #[serde(default = "default_clean_interval")]
    pub clean_interval_secs: u64,
    /// Upstream API JSON bodies.
    #[serde(default = "default_api_cache")]
    pub api: CacheConfig,
    /// Raw file contents fetched at a tag.
    #[serde(default = "default_files_cache")]
    pub files: CacheConfig,
    /// Complete HTTP responses served by this service.
    #[serde(default = "default_responses_cache")]
    pub responses: CacheConfig,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            clean_interval_secs: default_clean_interval(),
            api: default_api_cache(),
            files: default_files_cache(),
            responses: default_responses_cache(),
        }
    }
}

/// One cache instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Root directory, required by the disk backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Entry lifetime in seconds.  Unset means entries never expire.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_clean_interval() -> u64 {
    300
}

fn default_api_cache() -> CacheConfig {
    CacheConfig {
        backend: BackendKind::Memory,
        path: None,
        ttl_secs: Some(300),
    }
}

fn default_files_cache() -> CacheConfig {
    // Contents at a tag rarely change; keep them for the life of the process.
    CacheConfig {
        backend: BackendKind::Memory,
        path: None,
        ttl_secs: None,
    }
}

fn default_responses_cache() -> CacheConfig {
    CacheConfig {
        backend: BackendKind::Memory,
        path: None,
        ttl_secs: Some(60),
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.cache.clean_interval_secs > 0,
        "cache.clean_interval_secs must be greater than zero"
    );
    for (name, cache) in [
        ("api", &config.cache.api),
        ("files", &config.cache.files),
        ("responses", &config.cache.responses),
    ] {
        anyhow::ensure!(
            cache.backend != BackendKind::Disk || cache.path.is_some(),
            "cache.{name} uses the disk backend but has no path"
        );
        anyhow::ensure!(
            cache.ttl_secs != Some(0),
            "cache.{name}.ttl_secs must be greater than zero"
        );
    }
    anyhow::ensure!(
        config.cache.responses.backend != BackendKind::Disk,
        "cache.responses cannot use the disk backend"
    );
    anyhow::ensure!(
        config.manifest.package_manifest_path.starts_with('/'),
        "manifest.package_manifest_path must start with '/'"
    );
    anyhow::ensure!(
        !config.manifest.id_prefix.is_empty(),
        "manifest.id_prefix must not be empty"
    );
    Ok(())
}
