use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the dataset service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Merge cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Upload limits and defaults
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for dataset objects
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Create the bucket on startup when it does not exist
    #[serde(default = "default_true")]
    pub create_bucket: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Merge cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a merge result in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between background sweeps of expired entries
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Page size used when a preview request does not name one
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    /// Largest page size a preview request may ask for
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Number of rows returned inline with a merge response
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
}

/// Upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted file in bytes
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    /// Recorded as the uploader when the request does not name one
    #[serde(default = "default_uploaded_by")]
    pub default_uploaded_by: String,
}

// Default value functions
fn default_service_name() -> String {
    "dataset-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_page_size() -> usize {
    50
}

fn default_max_page_size() -> usize {
    1000
}

fn default_preview_rows() -> usize {
    5
}

fn default_max_file_bytes() -> usize {
    100 * 1024 * 1024 // 100MB
}

fn default_uploaded_by() -> String {
    "anonymous".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "dataset-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/dataset").required(false))
            .add_source(config::File::with_name("/etc/dataset-service/dataset").required(false))
            // Override with environment variables
            // DATASET__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("DATASET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get merge cache TTL as Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// Get merge cache sweep interval as Duration
    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs.max(1))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            preview_rows: default_preview_rows(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            default_uploaded_by: default_uploaded_by(),
        }
    }
}
