//! Stratorun Configuration
//!
//! This module provides configuration structures for the stratorun
//! execution-dispatch middleware.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// Main stratorun configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StratorunConfig {
    /// Gateway server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-session channel I/O limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Sandbox manifest settings
    #[serde(default)]
    pub manifest: ManifestConfig,

    /// Timeouts for client and backend I/O
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Job execution configuration
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Storage cluster ring configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Rendezvous name-service configuration
    #[serde(default)]
    pub name_service: NameServiceConfig,

    /// Template registry for "open" commands
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Execution accounting configuration
    #[serde(default)]
    pub accounting: AccountingConfig,

    /// Pre-warmed daemon runners, socket id to job config path
    #[serde(default)]
    pub daemons: Vec<DaemonEntry>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the submission API
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Base URL of the storage cluster proxy
    #[serde(default = "default_storage_url")]
    pub storage_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            storage_url: default_storage_url(),
        }
    }
}

/// Per-session channel I/O limits, rendered into manifests and
/// connect strings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum read operations per channel
    #[serde(default = "default_iops")]
    pub reads: u64,

    /// Maximum write operations per channel
    #[serde(default = "default_iops")]
    pub writes: u64,

    /// Maximum bytes read per channel
    #[serde(default = "default_iobytes")]
    pub rbytes: u64,

    /// Maximum bytes written per channel
    #[serde(default = "default_iobytes")]
    pub wbytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            reads: default_iops(),
            writes: default_iops(),
            rbytes: default_iobytes(),
            wbytes: default_iobytes(),
        }
    }
}

/// Sandbox manifest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Manifest format version understood by the sandbox runtime
    #[serde(default = "default_manifest_version")]
    pub version: String,

    /// Sandbox session timeout in seconds
    #[serde(default = "default_manifest_timeout")]
    pub timeout: u64,

    /// Sandbox memory limit in bytes
    #[serde(default = "default_manifest_memory")]
    pub memory: u64,

    /// Map the executable as /dev/self inside the sandbox
    #[serde(default = "default_true")]
    pub use_dev_self: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            version: default_manifest_version(),
            timeout: default_manifest_timeout(),
            memory: default_manifest_memory(),
            use_dev_self: default_true(),
        }
    }
}

/// Timeouts for client and backend I/O, in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Initial backend connect timeout
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout_secs: u64,

    /// Per-chunk backend response read timeout
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,

    /// Per-chunk client body read timeout
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Upload deadline for buffered submission bodies
    #[serde(default = "default_max_upload_time")]
    pub max_upload_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            conn_timeout_secs: default_conn_timeout(),
            node_timeout_secs: default_node_timeout(),
            client_timeout_secs: default_client_timeout(),
            max_upload_secs: default_max_upload_time(),
        }
    }
}

/// Job execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum size of a submitted job config, in bytes
    #[serde(default = "default_max_config")]
    pub max_config: usize,

    /// Chunk size for all network streaming
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Default content type for unknown files
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Request newest object versions on internal reads
    #[serde(default)]
    pub uses_newest: bool,

    /// Reuse stored executable validation to skip startup validation
    #[serde(default)]
    pub prevalidate: bool,

    /// Copy container CORS settings onto execute responses
    #[serde(default)]
    pub use_cors: bool,

    /// System-image device names mapped to host file paths
    #[serde(default)]
    pub sysimage_devices: HashMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_config: default_max_config(),
            chunk_size: default_chunk_size(),
            default_content_type: default_content_type(),
            uses_newest: false,
            prevalidate: false,
            use_cors: false,
            sysimage_devices: HashMap::new(),
        }
    }
}

/// Storage cluster ring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Worker host entries, `ip:port/device`
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Number of ring partitions
    #[serde(default = "default_partition_count")]
    pub partition_count: u64,

    /// Storage replica count
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            partition_count: default_partition_count(),
            replica_count: default_replica_count(),
        }
    }
}

/// Rendezvous name-service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServiceConfig {
    /// Advertised hostname or IP; autodetected when unset
    #[serde(default)]
    pub hostname: Option<String>,

    /// Maximum concurrently running name services
    #[serde(default = "default_ns_pool")]
    pub max_pool: usize,
}

impl Default for NameServiceConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            max_pool: default_ns_pool(),
        }
    }
}

/// Template registry for "open" commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Container holding per-content-type templates
    #[serde(default = "default_registry_container")]
    pub container: String,

    /// Template cache TTL in seconds
    #[serde(default = "default_registry_ttl")]
    pub cache_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            container: default_registry_container(),
            cache_timeout_secs: default_registry_ttl(),
        }
    }
}

/// Execution accounting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingConfig {
    /// Ship per-worker accounting lines to the stats account
    #[serde(default)]
    pub enabled: bool,

    /// System account receiving accounting logs
    #[serde(default = "default_cdr_account")]
    pub cdr_account: String,

    /// Storage API version prefix for log paths
    #[serde(default = "default_api_version")]
    pub version: String,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cdr_account: default_cdr_account(),
            version: default_api_version(),
        }
    }
}

/// One pre-warmed daemon runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonEntry {
    /// Stable socket id of the daemon
    pub socket: String,

    /// Path to the one-node job config the daemon was started with
    pub config_path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StratorunConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.execution.max_config == 0 {
            return Err(crate::error::Error::Config(
                "execution.max_config must be positive".to_string(),
            ));
        }
        if self.execution.chunk_size == 0 {
            return Err(crate::error::Error::Config(
                "execution.chunk_size must be positive".to_string(),
            ));
        }
        if self.name_service.max_pool == 0 {
            return Err(crate::error::Error::Config(
                "name_service.max_pool must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Example configuration for `stratorun init`
    pub fn example() -> Self {
        let mut config = Self::default();
        config
            .execution
            .sysimage_devices
            .insert("python".to_string(), "/opt/images/python.tar".to_string());
        config
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_storage_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_iops() -> u64 {
    1024 * 1048576
}

fn default_iobytes() -> u64 {
    1024 * 1048576
}

fn default_manifest_version() -> String {
    "20130611".to_string()
}

fn default_manifest_timeout() -> u64 {
    50
}

fn default_manifest_memory() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_conn_timeout() -> u64 {
    1
}

fn default_node_timeout() -> u64 {
    30
}

fn default_client_timeout() -> u64 {
    60
}

fn default_max_upload_time() -> u64 {
    86400
}

fn default_max_config() -> usize {
    65536
}

fn default_chunk_size() -> usize {
    65536
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

fn default_ns_pool() -> usize {
    1000
}

fn default_partition_count() -> u64 {
    1024
}

fn default_replica_count() -> u32 {
    3
}

fn default_registry_container() -> String {
    ".zvm".to_string()
}

fn default_registry_ttl() -> u64 {
    60
}

fn default_cdr_account() -> String {
    "userstats".to_string()
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
