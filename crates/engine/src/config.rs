//! Transaction layer configuration via `strata-txn.toml`
//!
//! A missing file means defaults. On first start a commented default file
//! can be written next to the data; edit it and restart to change settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use strata_core::{StrataError, StrataResult};
use strata_storage::ParticipantOptions;

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "strata-txn.toml";

/// Transaction layer configuration loaded from `strata-txn.toml`.
///
/// # Example
///
/// ```toml
/// max_clock_skew_us = 500000
/// heartbeat_interval_ms = 500
/// transaction_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Bound on clock skew between nodes; width of the uncertainty window.
    pub max_clock_skew_us: u64,
    /// Interval between heartbeats of a running transaction.
    pub heartbeat_interval_ms: u64,
    /// Lease after which a transaction without heartbeats is aborted.
    pub transaction_timeout_ms: u64,
    /// Interval of the coordinator expiry and cleanup sweep.
    pub status_sweep_interval_ms: u64,
    /// Minimum gap between resends of an unacknowledged apply notification.
    pub apply_retry_interval_ms: u64,
    /// Age after which compaction may drop intents of aborted transactions.
    pub aborted_intent_cleanup_ms: u64,
    /// How long a fully applied status record is kept before removal.
    pub status_retention_ms: u64,
    /// Deadline for commit and abort to complete.
    pub rpc_timeout_ms: u64,
    /// Background worker threads.
    pub scheduler_threads: usize,
    /// Maximum queued background tasks.
    pub max_queue_depth: usize,
    /// Test instrumentation: never send periodic heartbeats.
    pub disable_heartbeat_in_tests: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_us: 500_000,
            heartbeat_interval_ms: 500,
            transaction_timeout_ms: 5_000,
            status_sweep_interval_ms: 250,
            apply_retry_interval_ms: 100,
            aborted_intent_cleanup_ms: 60_000,
            status_retention_ms: 5_000,
            rpc_timeout_ms: 5_000,
            scheduler_threads: 2,
            max_queue_depth: 4096,
            disable_heartbeat_in_tests: false,
        }
    }
}

impl TxnConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Strata transaction layer configuration

# Maximum clock skew between any two nodes, in microseconds.
# Reads may restart when they find writes inside this window.
max_clock_skew_us = 500000

# Heartbeat interval of a running transaction (ms).
heartbeat_interval_ms = 500

# A transaction that stops heartbeating is aborted after this long (ms).
transaction_timeout_ms = 5000

# Coordinator sweep: expire abandoned transactions, resend apply notifications.
status_sweep_interval_ms = 250
apply_retry_interval_ms = 100

# Compaction drops intents of aborted transactions older than this (ms).
aborted_intent_cleanup_ms = 60000

# Applied status records are retired after this long (ms).
status_retention_ms = 5000

# Deadline for commit/abort to complete (ms).
rpc_timeout_ms = 5000

# Background workers and queue bound.
scheduler_threads = 2
max_queue_depth = 4096

# Test instrumentation only.
disable_heartbeat_in_tests = false
"#
    }

    /// Check that the settings can work together.
    pub fn validate(&self) -> StrataResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(StrataError::invalid_input(
                "heartbeat_interval_ms must be greater than zero",
            ));
        }
        if self.heartbeat_interval_ms >= self.transaction_timeout_ms {
            return Err(StrataError::invalid_input(format!(
                "heartbeat_interval_ms ({}) must be below transaction_timeout_ms ({})",
                self.heartbeat_interval_ms, self.transaction_timeout_ms
            )));
        }
        if self.status_sweep_interval_ms == 0 {
            return Err(StrataError::invalid_input(
                "status_sweep_interval_ms must be greater than zero",
            ));
        }
        if self.scheduler_threads == 0 {
            return Err(StrataError::invalid_input(
                "scheduler_threads must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Read, parse and validate config from a file path.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: TxnConfig = toml::from_str(&content).map_err(|e| {
            StrataError::invalid_input(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> StrataResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                StrataError::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StrataResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StrataError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            StrataError::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Sweep interval as a duration.
    pub fn status_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.status_sweep_interval_ms)
    }

    /// Commit/abort deadline as a duration.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Transaction lease in microseconds.
    pub fn transaction_timeout_us(&self) -> u64 {
        self.transaction_timeout_ms.saturating_mul(1_000)
    }

    /// Apply resend gap in microseconds.
    pub fn apply_retry_interval_us(&self) -> u64 {
        self.apply_retry_interval_ms.saturating_mul(1_000)
    }

    /// Status record retention in microseconds.
    pub fn status_retention_us(&self) -> u64 {
        self.status_retention_ms.saturating_mul(1_000)
    }

    /// Participant tunables derived from this config.
    pub fn participant_options(&self) -> ParticipantOptions {
        ParticipantOptions {
            aborted_intent_cleanup_us: self.aborted_intent_cleanup_ms.saturating_mul(1_000),
            ..ParticipantOptions::default()
        }
    }

    /// Config suited to tests: small skew, fast heartbeats and sweeps.
    pub fn for_tests() -> Self {
        Self {
            max_clock_skew_us: 50_000,
            heartbeat_interval_ms: 50,
            transaction_timeout_ms: 1_000,
            status_sweep_interval_ms: 20,
            apply_retry_interval_ms: 20,
            aborted_intent_cleanup_ms: 1_000,
            status_retention_ms: 200,
            rpc_timeout_ms: 5_000,
            ..Self::default()
        }
    }
}
