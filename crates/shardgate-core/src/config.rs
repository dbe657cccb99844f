//! Configuration management for shardgate.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ConsistencyLevel, RingProps};

/// Default per-backend request timeout in milliseconds.
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 30_000;

/// Default delay before a record becomes visible to the repair pipeline.
pub const DEFAULT_EXECUTION_DELAY_SECS: u64 = 5 * 60;

/// Delay for multipart initiations, which wait for their final assembly.
pub const DEFAULT_MULTIPART_DELAY_SECS: u64 = 7 * 24 * 60 * 60;

/// Extension granted to a record after a successful multipart completion.
pub const DEFAULT_COMPLETION_EXTENSION_SECS: u64 = 5 * 60;

/// Metadata header used to stamp object versions on backends.
pub const DEFAULT_VERSION_HEADER: &str = "x-amz-meta-object-version";

/// Response header that hands the allocated version back to clients.
pub const DEFAULT_VERSION_RESPONSE_HEADER: &str = "x-object-version";

/// Default number of records claimed per feeder cycle.
pub const DEFAULT_FEEDER_BATCH_SIZE: usize = 100;

/// Default feeder sleep when nothing is due, in milliseconds.
pub const DEFAULT_FEEDER_POLL_INTERVAL_MS: u64 = 5_000;

/// Default failure back-off added to a record's delay, in seconds.
pub const DEFAULT_FAILURE_DELAY_SECS: u64 = 10 * 60;

/// Default lease held on claimed records, in seconds.
pub const DEFAULT_LEASE_SECS: u64 = 30 * 60;

/// Default upper bound on one feeder cycle, in seconds.
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 20 * 60;

/// Default number of concurrent repair migrations.
pub const DEFAULT_MAX_CONCURRENT_REPAIRS: usize = 4;

/// Objects at or above this size are copied with multipart upload.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Part size used by multipart repair copies.
pub const DEFAULT_PART_SIZE: u64 = 16 * 1024 * 1024;

/// Main configuration for the shardgate proxy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Storage backends by name.
    pub backends: BTreeMap<String, BackendConfig>,
    /// Regions keyed by the domain clients address them with.
    pub regions: BTreeMap<String, RegionConfig>,
    /// Consistency ledger configuration.
    pub watchdog: WatchdogConfig,
    /// WAL feeder configuration.
    pub feeder: FeederConfig,
    /// Repair worker configuration.
    pub repair: RepairConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Loads `path` if given, otherwise the defaults, then validates.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or fails validation.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.validate().map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Validates cross-section references and numeric limits.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for (domain, region) in &self.regions {
            if region.backends.is_empty() {
                return Err(ConfigValidationError::EmptyRegion(domain.clone()));
            }
            for name in &region.backends {
                if !self.backends.contains_key(name) {
                    return Err(ConfigValidationError::UnknownBackend {
                        domain: domain.clone(),
                        backend: name.clone(),
                    });
                }
            }
        }
        for (name, backend) in &self.backends {
            if backend.endpoint.is_empty() {
                return Err(ConfigValidationError::MissingEndpoint(name.clone()));
            }
            if backend.timeout_ms == 0 {
                return Err(ConfigValidationError::InvalidTimeout(name.clone()));
            }
        }
        if self.feeder.batch_size == 0 {
            return Err(ConfigValidationError::InvalidBatchSize);
        }
        if self.repair.max_concurrent == 0 {
            return Err(ConfigValidationError::InvalidConcurrency);
        }
        if self.repair.part_size == 0 || self.repair.multipart_threshold < self.repair.part_size {
            return Err(ConfigValidationError::InvalidPartSize);
        }
        Ok(())
    }
}

/// Errors from configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    /// A region lists no backends.
    #[error("region '{0}' has no backends")]
    EmptyRegion(String),

    /// A region references a backend that is not defined.
    #[error("region '{domain}' references unknown backend '{backend}'")]
    UnknownBackend {
        /// Region domain.
        domain: String,
        /// Missing backend name.
        backend: String,
    },

    /// A backend has no endpoint.
    #[error("backend '{0}' has no endpoint")]
    MissingEndpoint(String),

    /// A backend timeout is zero.
    #[error("backend '{0}' timeout must be positive")]
    InvalidTimeout(String),

    /// Feeder batch size must be at least 1.
    #[error("feeder batch size must be at least 1")]
    InvalidBatchSize,

    /// Repair concurrency must be at least 1.
    #[error("repair max_concurrent must be at least 1")]
    InvalidConcurrency,

    /// Part size must be positive and not above the multipart threshold.
    #[error("repair part_size must be positive and at most multipart_threshold")]
    InvalidPartSize,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind: SocketAddr,
    /// Maximum request body size in bytes. Bodies are buffered in memory
    /// before fan-out, so this also bounds per-request memory.
    pub max_body_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9000)),
            max_body_size: 512 * 1024 * 1024, // 512 MiB
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
    /// Include HTTP request/response logging.
    pub log_requests: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty, log_requests: true }
    }
}

/// One storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://10.0.0.1:9000`.
    pub endpoint: String,
    /// Backend is under maintenance: its delete failures are soft and it is
    /// skipped for multipart routing.
    pub maintenance: bool,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { endpoint: String::new(), maintenance: false, timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS }
    }
}

impl BackendConfig {
    /// Returns the timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A region: the shard of backends that serves one domain.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegionConfig {
    /// Names of the backends holding copies of every object.
    pub backends: Vec<String>,
    /// Consistency level for writes.
    pub consistency: ConsistencyLevel,
    /// Whether read-repair records may be requested.
    pub read_repair: bool,
}

impl RegionConfig {
    /// Returns the ring properties of this region.
    pub fn ring_props(&self) -> RingProps {
        RingProps { consistency_level: self.consistency, read_repair: self.read_repair }
    }
}

/// Consistency ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Whether writes are recorded at all.
    pub enabled: bool,
    /// Path of the redb ledger file.
    pub path: PathBuf,
    /// Metadata header carrying the object version to backends.
    pub version_header: String,
    /// Response header carrying the allocated version to clients.
    pub version_response_header: String,
    /// Default execution delay in seconds.
    pub default_delay_secs: u64,
    /// Execution delay for multipart initiations in seconds.
    pub multipart_delay_secs: u64,
    /// Delay extension after a successful multipart completion in seconds.
    pub completion_extension_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/ledger.redb"),
            version_header: DEFAULT_VERSION_HEADER.to_string(),
            version_response_header: DEFAULT_VERSION_RESPONSE_HEADER.to_string(),
            default_delay_secs: DEFAULT_EXECUTION_DELAY_SECS,
            multipart_delay_secs: DEFAULT_MULTIPART_DELAY_SECS,
            completion_extension_secs: DEFAULT_COMPLETION_EXTENSION_SECS,
        }
    }
}

impl WatchdogConfig {
    /// Sets the version header.
    pub fn version_header(mut self, header: impl Into<String>) -> Self {
        self.version_header = header.into();
        self
    }

    /// Sets the default delay.
    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay_secs = delay.as_secs();
        self
    }

    /// Returns the default delay as a Duration.
    pub fn default_delay_duration(&self) -> Duration {
        Duration::from_secs(self.default_delay_secs)
    }

    /// Returns the multipart delay as a Duration.
    pub fn multipart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.multipart_delay_secs)
    }

    /// Returns the completion extension as a Duration.
    pub fn completion_extension_duration(&self) -> Duration {
        Duration::from_secs(self.completion_extension_secs)
    }
}

/// WAL feeder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederConfig {
    /// Maximum records claimed per cycle.
    pub batch_size: usize,
    /// Sleep between cycles when nothing is due, in milliseconds.
    pub poll_interval_ms: u64,
    /// Back-off added after a failed repair, in seconds.
    pub failure_delay_secs: u64,
    /// Lease held on claimed records, in seconds.
    pub lease_secs: u64,
    /// Upper bound on waiting for a cycle's entries, in seconds.
    pub cycle_timeout_secs: u64,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_FEEDER_BATCH_SIZE,
            poll_interval_ms: DEFAULT_FEEDER_POLL_INTERVAL_MS,
            failure_delay_secs: DEFAULT_FAILURE_DELAY_SECS,
            lease_secs: DEFAULT_LEASE_SECS,
            cycle_timeout_secs: DEFAULT_CYCLE_TIMEOUT_SECS,
        }
    }
}

impl FeederConfig {
    /// Sets the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the failure delay.
    pub fn failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay_secs = delay.as_secs();
        self
    }

    /// Returns the poll interval as a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the failure delay as a Duration.
    pub fn failure_delay_duration(&self) -> Duration {
        Duration::from_secs(self.failure_delay_secs)
    }

    /// Returns the lease as a Duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Returns the cycle timeout as a Duration.
    pub fn cycle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

/// Repair worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Maximum concurrent migrations.
    pub max_concurrent: usize,
    /// Objects at or above this size use multipart copies.
    pub multipart_threshold: u64,
    /// Part size for multipart copies.
    pub part_size: u64,
    /// Delete the object at the source once every destination holds it.
    pub move_objects: bool,
    /// Copy the bucket ACL when a destination bucket has to be created.
    pub copy_bucket_acl: bool,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_REPAIRS,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            move_objects: false,
            copy_bucket_acl: true,
        }
    }
}

impl RepairConfig {
    /// Sets the maximum concurrent migrations.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the multipart threshold and part size.
    pub fn multipart(mut self, threshold: u64, part_size: u64) -> Self {
        self.multipart_threshold = threshold;
        self.part_size = part_size;
        self
    }

    /// Sets move semantics.
    pub fn move_objects(mut self, enabled: bool) -> Self {
        self.move_objects = enabled;
        self
    }
}
