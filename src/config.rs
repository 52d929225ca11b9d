use crate::error::{CirrusError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub scaling: ScalingTargetConfiguration,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub changes: ChangesConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_max_label_length")]
    pub max_label_length: usize,
    #[serde(default = "default_max_request_body_mb")]
    pub max_request_body_mb: usize,
}

/// Object store backing change batches, snapshots and infrastructure records.
///
/// `backend` is one of `s3`, `local` or `memory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_secret_access_key: Option<String>,
    #[serde(default)]
    pub s3_allow_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Scratch directory for snapshot files.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_ephemeral_limit_mb")]
    pub ephemeral_limit_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// How long to wait on one lambda before racing the next candidate.
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,
}

/// Number of warm instances to keep per tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingTargetConfiguration {
    #[serde(default = "default_warm_primary", alias = "warm_primary_instances")]
    pub warm_primary_instances: usize,
    #[serde(default, alias = "warm_secondary_instances")]
    pub warm_secondary_instances: usize,
    #[serde(default, alias = "warm_regional_instances")]
    pub warm_regional_instances: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Accumulated changes that trigger a flush.
    #[serde(default = "default_max_changes_count")]
    pub max_changes_count: u64,
    /// Interval of the background keep-warm and flush check loop.
    #[serde(default = "default_keep_warm_interval")]
    pub keep_warm_interval_secs: u64,
    /// Duration of each keep-warm `wake` call.
    #[serde(default = "default_wake_duration_ms")]
    pub wake_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesConfig {
    /// Change-batch objects fetched per page when streaming the log.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_append_retries")]
    pub max_append_retries: u32,
}

/// Lambda topology created for each new database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub fallback_regions: Vec<String>,
    #[serde(default = "default_secondary_lambdas")]
    pub secondary_lambdas: usize,
    /// Concurrent instances one lambda may run.
    #[serde(default = "default_lambda_concurrency")]
    pub lambda_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// Default value functions
fn default_host() -> String {
    std::env::var("CIRRUS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}
fn default_port() -> u16 {
    env_parse("CIRRUS_PORT").unwrap_or(8080)
}
fn default_request_timeout() -> u64 {
    env_parse("CIRRUS_REQUEST_TIMEOUT_SECS").unwrap_or(30)
}
fn default_max_batch_size() -> usize {
    env_parse("CIRRUS_MAX_BATCH_SIZE").unwrap_or(10_000)
}
fn default_max_top_k() -> usize {
    env_parse("CIRRUS_MAX_TOP_K").unwrap_or(10_000)
}
fn default_shutdown_timeout_secs() -> u64 {
    env_parse("CIRRUS_SHUTDOWN_TIMEOUT_SECS").unwrap_or(5)
}
fn default_max_label_length() -> usize {
    1024
}
fn default_max_request_body_mb() -> usize {
    env_parse("CIRRUS_MAX_REQUEST_BODY_MB").unwrap_or(50)
}
fn default_backend() -> String {
    std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "s3".to_string())
}
fn default_bucket() -> String {
    std::env::var("S3_BUCKET").unwrap_or_else(|_| "cirrus".to_string())
}
fn default_scratch_dir() -> PathBuf {
    std::env::var("CIRRUS_SCRATCH_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("cirrus"))
}
fn default_memory_limit_mb() -> u64 {
    env_parse("CIRRUS_WORKER_MEMORY_LIMIT_MB").unwrap_or(2048)
}
fn default_ephemeral_limit_mb() -> u64 {
    env_parse("CIRRUS_WORKER_EPHEMERAL_LIMIT_MB").unwrap_or(512)
}
fn default_invoke_timeout_ms() -> u64 {
    env_parse("CIRRUS_INVOKE_TIMEOUT_MS").unwrap_or(1_000)
}
fn default_warm_primary() -> usize {
    1
}
fn default_max_changes_count() -> u64 {
    env_parse("CIRRUS_MAX_CHANGES_COUNT").unwrap_or(1_000)
}
fn default_keep_warm_interval() -> u64 {
    env_parse("CIRRUS_KEEP_WARM_INTERVAL_SECS").unwrap_or(300)
}
fn default_wake_duration_ms() -> u64 {
    250
}
fn default_page_size() -> usize {
    64
}
fn default_max_append_retries() -> u32 {
    3
}
fn default_region() -> String {
    std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string())
}
fn default_secondary_lambdas() -> usize {
    1
}
fn default_lambda_concurrency() -> usize {
    env_parse("CIRRUS_LAMBDA_CONCURRENCY").unwrap_or(32)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    std::env::var("CIRRUS_LOG_FORMAT").unwrap_or_else(|_| "json".to_string())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_batch_size: default_max_batch_size(),
            max_top_k: default_max_top_k(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_label_length: default_max_label_length(),
            max_request_body_mb: default_max_request_body_mb(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            bucket: default_bucket(),
            s3_region: std::env::var("AWS_REGION").ok(),
            s3_endpoint: std::env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            s3_access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            s3_secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            s3_allow_http: std::env::var("S3_ALLOW_HTTP")
                .ok()
                .map(|v| v == "true")
                .unwrap_or(false),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            memory_limit_mb: default_memory_limit_mb(),
            ephemeral_limit_mb: default_ephemeral_limit_mb(),
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: default_invoke_timeout_ms(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_changes_count: default_max_changes_count(),
            keep_warm_interval_secs: default_keep_warm_interval(),
            wake_duration_ms: default_wake_duration_ms(),
        }
    }
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_append_retries: default_max_append_retries(),
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            fallback_regions: Vec::new(),
            secondary_lambdas: default_secondary_lambdas(),
            lambda_concurrency: default_lambda_concurrency(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ScalingTargetConfiguration {
    fn default() -> Self {
        Self {
            warm_primary_instances: default_warm_primary(),
            warm_secondary_instances: 0,
            warm_regional_instances: 0,
        }
    }
}

impl ScalingTargetConfiguration {
    /// Total warm instances across every tier.
    pub fn total(&self) -> usize {
        self.warm_primary_instances + self.warm_secondary_instances + self.warm_regional_instances
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    /// Env var overrides are applied afterwards: env > file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    CirrusError::Config(format!("failed to read config file {p}: {e}"))
                })?;
                toml::from_str(&content)
                    .map_err(|e| CirrusError::Config(format!("failed to parse config: {e}")))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.changes.page_size == 0 {
            return Err(CirrusError::Config("changes.page_size must be > 0".into()));
        }
        if self.deployment.lambda_concurrency == 0 {
            return Err(CirrusError::Config(
                "deployment.lambda_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(v) = std::env::var("CIRRUS_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env_parse("CIRRUS_PORT") {
            self.server.port = v;
        }
        if let Some(v) = env_parse("CIRRUS_REQUEST_TIMEOUT_SECS") {
            self.server.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("CIRRUS_MAX_BATCH_SIZE") {
            self.server.max_batch_size = v;
        }
        if let Some(v) = env_parse("CIRRUS_MAX_TOP_K") {
            self.server.max_top_k = v;
        }
        if let Some(v) = env_parse("CIRRUS_SHUTDOWN_TIMEOUT_SECS") {
            self.server.shutdown_timeout_secs = v;
        }
        if let Some(v) = env_parse("CIRRUS_MAX_REQUEST_BODY_MB") {
            self.server.max_request_body_mb = v;
        }

        // Storage
        if let Ok(v) = std::env::var("STORAGE_BACKEND") {
            self.storage.backend = v;
        }
        if let Ok(v) = std::env::var("S3_BUCKET") {
            self.storage.bucket = v;
        }
        if let Ok(v) = std::env::var("AWS_REGION") {
            self.storage.s3_region = Some(v);
        }
        if let Some(v) = std::env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()) {
            self.storage.s3_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_ACCESS_KEY_ID") {
            self.storage.s3_access_key_id = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            self.storage.s3_secret_access_key = Some(v);
        }
        if let Ok(v) = std::env::var("S3_ALLOW_HTTP") {
            self.storage.s3_allow_http = v == "true";
        }

        // Worker
        if let Ok(v) = std::env::var("CIRRUS_SCRATCH_DIR") {
            self.worker.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("CIRRUS_WORKER_MEMORY_LIMIT_MB") {
            self.worker.memory_limit_mb = v;
        }
        if let Some(v) = env_parse("CIRRUS_WORKER_EPHEMERAL_LIMIT_MB") {
            self.worker.ephemeral_limit_mb = v;
        }

        // Partition / flush / deployment
        if let Some(v) = env_parse("CIRRUS_INVOKE_TIMEOUT_MS") {
            self.partition.invoke_timeout_ms = v;
        }
        if let Some(v) = env_parse("CIRRUS_MAX_CHANGES_COUNT") {
            self.flush.max_changes_count = v;
        }
        if let Some(v) = env_parse("CIRRUS_KEEP_WARM_INTERVAL_SECS") {
            self.flush.keep_warm_interval_secs = v;
        }
        if let Some(v) = env_parse("CIRRUS_LAMBDA_CONCURRENCY") {
            self.deployment.lambda_concurrency = v;
        }
        if let Ok(v) = std::env::var("CIRRUS_FALLBACK_REGIONS") {
            self.deployment.fallback_regions = v
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
        }

        // Logging
        if let Ok(v) = std::env::var("CIRRUS_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}
