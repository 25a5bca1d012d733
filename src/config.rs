//! Configuration loading and types for mediacms.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: the ops listener, logging, metadata persistence, blob storage,
//! URL signing, pagination and media preparation.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Ops HTTP server settings (health checks and metrics only).
    #[serde(default)]
    pub server: ServerConfig,

    /// Deployment environment. Anything other than `production` prefixes
    /// every object key with `dev/`.
    #[serde(default)]
    pub environment: Environment,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Blob storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Signed URL lifetimes.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Cursor pagination limits.
    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Image preparation settings.
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health checks).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for pending background cleanups on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Dev,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/healthz` and `/readyz` endpoints.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetadataConfig {
    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Blob storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local`, `memory` or `s3`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Upper bound for any single blob or metadata call made by a
    /// lifecycle operation, in seconds.
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// S3 configuration.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            op_timeout_secs: default_op_timeout(),
            local: LocalStorageConfig::default(),
            s3: None,
        }
    }
}

impl StorageConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,

    /// Base URL that signed links are issued against.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// HMAC secret used to sign and verify local download links.
    #[serde(default = "default_signing_secret")]
    pub signing_secret: String,
}

impl LocalStorageConfig {
    /// Path component of `public_base_url`, where the ops server serves
    /// signed downloads.  Falls back to `/media` when the URL has none.
    pub fn mount_path(&self) -> String {
        let url = self.public_base_url.trim();
        let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
        let path = after_scheme
            .find('/')
            .map_or("", |i| &after_scheme[i..])
            .split(['?', '#'])
            .next()
            .unwrap_or("")
            .trim_end_matches('/');
        if path.is_empty() {
            "/media".to_string()
        } else {
            path.to_string()
        }
    }
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
            public_base_url: default_public_base_url(),
            signing_secret: default_signing_secret(),
        }
    }
}

/// S3 (or S3-compatible) blob store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// Bucket that holds every object key.
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

/// Signed URL lifetimes, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Lifetime of URLs embedded in list responses.
    #[serde(default = "default_listing_ttl")]
    pub listing_ttl_secs: u64,

    /// Lifetime of URLs embedded in news list responses.
    #[serde(default = "default_news_listing_ttl")]
    pub news_listing_ttl_secs: u64,

    /// Lifetime of URLs returned when a single resource is viewed.
    #[serde(default = "default_view_ttl")]
    pub view_ttl_secs: u64,

    /// Returned in place of a URL that could not be signed.
    #[serde(default)]
    pub placeholder_url: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            listing_ttl_secs: default_listing_ttl(),
            news_listing_ttl_secs: default_news_listing_ttl(),
            view_ttl_secs: default_view_ttl(),
            placeholder_url: String::new(),
        }
    }
}

impl SigningConfig {
    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_secs)
    }

    pub fn news_listing_ttl(&self) -> Duration {
        Duration::from_secs(self.news_listing_ttl_secs)
    }

    pub fn view_ttl(&self) -> Duration {
        Duration::from_secs(self.view_ttl_secs)
    }
}

/// Cursor pagination limits.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PaginationConfig {
    /// Page size used when the caller sends no (or an unusable) limit.
    #[serde(default = "default_page_limit")]
    pub default_limit: u32,

    /// Largest page size a caller may request.
    #[serde(default = "default_page_limit")]
    pub max_limit: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: default_page_limit(),
            max_limit: default_page_limit(),
        }
    }
}

/// Image preparation settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MediaConfig {
    /// Largest accepted upload, in bytes.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// JPEG re-encode quality (1-100).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_metadata_path() -> String {
    "./data/mediacms.db".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_op_timeout() -> u64 {
    30
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:9090/media".to_string()
}

fn default_signing_secret() -> String {
    "mediacms-dev-secret".to_string()
}

fn default_listing_ttl() -> u64 {
    3_600 // 1 hour
}

fn default_news_listing_ttl() -> u64 {
    600 // 10 minutes
}

fn default_view_ttl() -> u64 {
    604_800 // 1 week
}

fn default_page_limit() -> u32 {
    20
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.signing.listing_ttl_secs, 3_600);
        assert_eq!(config.signing.news_listing_ttl_secs, 600);
        assert_eq!(config.signing.view_ttl_secs, 604_800);
        assert_eq!(config.pagination.default_limit, 20);
        assert_eq!(config.media.jpeg_quality, 80);
        assert_eq!(config.storage.backend, "local");
    }

    #[test]
    fn test_s3_section_and_dev_environment() {
        let yaml = r#"
environment: dev
storage:
  backend: s3
  op_timeout_secs: 5
  s3:
    bucket: media
    endpoint_url: "http://localhost:9000"
    use_path_style: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.environment, Environment::Dev);
        assert_eq!(config.storage.op_timeout(), Duration::from_secs(5));
        let s3 = config.storage.s3.unwrap();
        assert_eq!(s3.bucket, "media");
        assert_eq!(s3.region, "us-east-1");
        assert!(s3.use_path_style);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yaml");
        std::fs::write(&path, "pagination:\n  max_limit: 50\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.pagination.max_limit, 50);
        assert_eq!(config.pagination.default_limit, 20);
    }

    #[test]
    fn test_mount_path_from_public_base_url() {
        let mut local = LocalStorageConfig::default();
        assert_eq!(local.mount_path(), "/media");
        local.public_base_url = "https://cdn.example.com/assets/v1/".to_string();
        assert_eq!(local.mount_path(), "/assets/v1");
        local.public_base_url = "http://localhost:9090".to_string();
        assert_eq!(local.mount_path(), "/media");
    }

    #[test]
    fn test_example_file_parses() {
        let config = load_config(concat!(env!("CARGO_MANIFEST_DIR"), "/mediacms.example.yaml"))
            .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.logging.format, "text");
        assert!(config.storage.s3.is_none());
    }
}
