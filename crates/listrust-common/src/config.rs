//! Configuration for ListRust

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable prefix for overrides, e.g. `LISTRUST__QUEUE__MAX_ATTEMPTS=3`
const ENV_PREFIX: &str = "LISTRUST";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration (list store)
    pub database: DatabaseConfig,

    /// Storage configuration (queues, digest mailboxes)
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Queue and runner configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Rule and handler pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Administrivia rule configuration
    #[serde(default)]
    pub administrivia: AdministriviaConfig,

    /// DMARC rule configuration
    #[serde(default)]
    pub dmarc: DmarcConfig,

    /// Digest configuration
    #[serde(default)]
    pub digest: DigestConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: only "postgres" is supported
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend: only "fs" is supported
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Base path for queues and per-list data
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_backend() -> String {
    "fs".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/listrust")
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
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

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Queue and runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long an idle runner sleeps between empty dequeues
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Claims older than this are considered abandoned and redelivered
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,

    /// Deliveries before an item is shunted to the bad queue
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay; doubles with every attempt
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,

    /// Runners sharing the incoming queue
    #[serde(default = "default_runner_count")]
    pub incoming_runners: usize,

    /// Runners sharing the digest-build queue
    #[serde(default = "default_runner_count")]
    pub digest_runners: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            claim_timeout_secs: default_claim_timeout(),
            max_attempts: default_max_attempts(),
            retry_base_secs: default_retry_base(),
            retry_max_secs: default_retry_max(),
            incoming_runners: default_runner_count(),
            digest_runners: default_runner_count(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_claim_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base() -> u64 {
    60
}

fn default_retry_max() -> u64 {
    4 * 60 * 60
}

fn default_runner_count() -> usize {
    1
}

/// Ordered rule and handler names, resolved against the registries at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<String>,

    #[serde(default = "default_handlers")]
    pub handlers: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            handlers: default_handlers(),
        }
    }
}

fn default_rules() -> Vec<String> {
    vec![
        "administrivia".to_string(),
        "suspicious-header".to_string(),
        "dmarc-mitigation".to_string(),
    ]
}

fn default_handlers() -> Vec<String> {
    vec![
        "moderate".to_string(),
        "to-digest".to_string(),
        "to-outgoing".to_string(),
    ]
}

/// Allowed argument count for an email command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArity {
    pub min: usize,
    pub max: usize,
}

impl CommandArity {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Whether `count` arguments fall within `[min, max]`
    pub fn accepts(&self, count: usize) -> bool {
        self.min <= count && count <= self.max
    }
}

/// Administrivia rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdministriviaConfig {
    /// Non-blank body lines examined for commands
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Known commands, keyed by lowercase command word
    #[serde(default = "default_email_commands")]
    pub commands: BTreeMap<String, CommandArity>,
}

impl Default for AdministriviaConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            commands: default_email_commands(),
        }
    }
}

fn default_max_lines() -> usize {
    10
}

fn default_email_commands() -> BTreeMap<String, CommandArity> {
    [
        ("confirm", CommandArity::new(1, 1)),
        ("help", CommandArity::new(0, 0)),
        ("info", CommandArity::new(0, 0)),
        ("lists", CommandArity::new(0, 0)),
        ("options", CommandArity::new(0, 0)),
        ("password", CommandArity::new(2, 2)),
        ("remove", CommandArity::new(0, 0)),
        ("set", CommandArity::new(3, 3)),
        ("subscribe", CommandArity::new(0, 3)),
        ("unsubscribe", CommandArity::new(0, 1)),
        ("who", CommandArity::new(0, 2)),
    ]
    .into_iter()
    .map(|(name, arity)| (name.to_string(), arity))
    .collect()
}

/// DMARC rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmarcConfig {
    /// Where to fetch public suffix data from (http(s)://, file:// or a path)
    #[serde(default = "default_org_domain_data_url")]
    pub org_domain_data_url: Option<String>,

    /// Per-query resolver timeout
    #[serde(default = "default_resolver_timeout")]
    pub resolver_timeout_ms: u64,

    /// Upper bound on one complete DMARC lookup
    #[serde(default = "default_resolver_lifetime")]
    pub resolver_lifetime_ms: u64,
}

impl Default for DmarcConfig {
    fn default() -> Self {
        Self {
            org_domain_data_url: default_org_domain_data_url(),
            resolver_timeout_ms: default_resolver_timeout(),
            resolver_lifetime_ms: default_resolver_lifetime(),
        }
    }
}

fn default_org_domain_data_url() -> Option<String> {
    Some("https://publicsuffix.org/list/public_suffix_list.dat".to_string())
}

fn default_resolver_timeout() -> u64 {
    3000
}

fn default_resolver_lifetime() -> u64 {
    5000
}

/// Digest configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Interval for forced sends on lists with periodic digests; absent disables
    pub periodic_send_secs: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the first file found plus environment overrides
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./listrust.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/listrust/config.toml"),
        ];

        let found = paths.into_iter().find(|path| path.exists()).ok_or_else(|| {
            crate::Error::Config("No configuration file found".to_string())
        })?;

        Self::load_layered(&found)
    }

    /// Load one file and apply `LISTRUST__*` environment overrides on top
    pub fn load_layered(path: &Path) -> crate::Result<Self> {
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }
}
