//! DocRepl Configuration
//!
//! Configuration structures for the replication core. Loaded from TOML;
//! every field has a default so a minimal file only needs `[node]`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Main DocRepl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocReplConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Operation log configuration
    #[serde(default)]
    pub oplog: OplogConfig,

    /// Sync / pull loop configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Ghost sync tracker configuration
    #[serde(default)]
    pub ghost: GhostConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Numeric writer identity, mixed into every oplog entry hash
    pub writer_id: i64,

    /// Human-readable node name (host:port), used in sync source checks
    pub name: String,
}

/// Operation log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogConfig {
    /// Namespace of the append-only entry store
    #[serde(default = "default_oplog_ns")]
    pub oplog_ns: String,

    /// Namespace of the two-record checkpoint store
    #[serde(default = "default_replinfo_ns")]
    pub replinfo_ns: String,

    /// Warn when an insert without a document id takes at least this long (ms)
    #[serde(default = "default_slow_apply_ms")]
    pub slow_apply_warn_ms: u64,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            oplog_ns: default_oplog_ns(),
            replinfo_ns: default_replinfo_ns(),
            slow_apply_warn_ms: default_slow_apply_ms(),
        }
    }
}

/// Sync / pull loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bounded wait for new remote entries before a liveness check (ms)
    #[serde(default = "default_pull_wait_ms")]
    pub pull_wait_ms: u64,

    /// Backoff after a transient source fault (ms, jittered)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Warn when a forced sync source lags the known max position
    /// by at least this many entries (the choice is still honored)
    #[serde(default = "default_lag_warn_threshold")]
    pub source_lag_warn: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_wait_ms: default_pull_wait_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            source_lag_warn: default_lag_warn_threshold(),
        }
    }
}

/// Ghost sync tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostConfig {
    /// Hard capacity of the tracked-replica registry; least-recently
    /// updated entries are evicted past this
    #[serde(default = "default_ghost_capacity")]
    pub capacity: usize,

    /// Warn when the registry occupancy crosses this threshold
    #[serde(default = "default_ghost_warn")]
    pub warn_threshold: usize,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            capacity: default_ghost_capacity(),
            warn_threshold: default_ghost_warn(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
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

impl DocReplConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

fn default_oplog_ns() -> String {
    "local.oplog".to_string()
}

fn default_replinfo_ns() -> String {
    "local.replinfo".to_string()
}

fn default_slow_apply_ms() -> u64 {
    2
}

fn default_pull_wait_ms() -> u64 {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_lag_warn_threshold() -> u64 {
    10_000
}

fn default_ghost_capacity() -> usize {
    4096
}

fn default_ghost_warn() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
