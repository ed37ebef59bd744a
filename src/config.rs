// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the migration control plane.
//!
//! Configuration is constructed programmatically or deserialized from
//! JSON/YAML. Duration fields are human-readable strings (`"100ms"`, `"5m"`)
//! parsed with `humantime`; unparseable values fall back to the default.
//!
//! # Quick Start
//!
//! ```rust
//! use keyspace_migrator::config::{MigratorConfig, StoreConfig};
//!
//! let config = MigratorConfig {
//!     store: StoreConfig::at("/var/lib/migrator/streams.db"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MigratorConfig
//! ├── stream: StreamSettings           # Copy/tail loop, retry budget, throttle
//! ├── orchestrator: OrchestratorSettings # Lag threshold, stream wait timeout
//! ├── store: StoreConfig               # SQLite stream store
//! └── router: RouterSettings           # Routing view refresh
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "stream": { "batch_size": 200, "poll_interval": "50ms", "throttle_enabled": true },
//!   "orchestrator": { "max_lag": "5s", "wait_timeout": "10m" },
//!   "store": { "sqlite_path": "/var/lib/migrator/streams.db" }
//! }
//! ```

use crate::error::{MigrationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigratorConfig {
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub router: RouterSettings,
}

impl MigratorConfig {
    /// Fast timings for tests, storing streams at `sqlite_path`.
    pub fn for_testing(sqlite_path: &str) -> Self {
        Self {
            stream: StreamSettings::for_testing(),
            orchestrator: OrchestratorSettings::for_testing(),
            store: StoreConfig::at(sqlite_path),
            router: RouterSettings::for_testing(),
        }
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.stream.batch_size == 0 {
            return Err(MigrationError::Config("stream.batch_size must be > 0".into()));
        }
        if self.stream.copy_chunk_rows == 0 {
            return Err(MigrationError::Config("stream.copy_chunk_rows must be > 0".into()));
        }
        if self.stream.max_concurrent_copies == 0 {
            return Err(MigrationError::Config(
                "stream.max_concurrent_copies must be > 0".into(),
            ));
        }
        if self.stream.retry_max_attempts == 0 {
            return Err(MigrationError::Config(
                "stream.retry_max_attempts must be > 0".into(),
            ));
        }
        if self.stream.throttle_enabled && self.stream.throttle_rows_per_sec == 0 {
            return Err(MigrationError::Config(
                "stream.throttle_rows_per_sec must be > 0 when throttling".into(),
            ));
        }
        if self.store.sqlite_path.is_empty() {
            return Err(MigrationError::Config("store.sqlite_path is empty".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamSettings: copy/tail loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication stream engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Maximum source events read per tail iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle wait when caught up, as a duration string.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Rows loaded per bulk-copy chunk.
    #[serde(default = "default_copy_chunk_rows")]
    pub copy_chunk_rows: usize,

    /// Tables copied concurrently across all streams.
    #[serde(default = "default_max_concurrent_copies")]
    pub max_concurrent_copies: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Retry budget (transient faults)
    // ─────────────────────────────────────────────────────────────────────────

    /// Attempts per read/apply before the stream goes to Error.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Apply throttle
    // ─────────────────────────────────────────────────────────────────────────

    /// Limit rows applied per second across all streams.
    #[serde(default)]
    pub throttle_enabled: bool,

    #[serde(default = "default_throttle_rows_per_sec")]
    pub throttle_rows_per_sec: u32,

    #[serde(default = "default_throttle_burst")]
    pub throttle_burst: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "100ms".to_string()
}

fn default_copy_chunk_rows() -> usize {
    1000
}

fn default_max_concurrent_copies() -> usize {
    4
}

fn default_retry_max_attempts() -> usize {
    10
}

fn default_retry_initial_delay() -> String {
    "100ms".to_string()
}

fn default_retry_max_delay() -> String {
    "30s".to_string()
}

fn default_throttle_rows_per_sec() -> u32 {
    10_000
}

fn default_throttle_burst() -> u32 {
    1000
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            copy_chunk_rows: default_copy_chunk_rows(),
            max_concurrent_copies: default_max_concurrent_copies(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            throttle_enabled: false,
            throttle_rows_per_sec: default_throttle_rows_per_sec(),
            throttle_burst: default_throttle_burst(),
        }
    }
}

impl StreamSettings {
    pub fn for_testing() -> Self {
        Self {
            poll_interval: "5ms".to_string(),
            copy_chunk_rows: 16,
            retry_max_attempts: 3,
            retry_initial_delay: "5ms".to_string(),
            retry_max_delay: "20ms".to_string(),
            ..Self::default()
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_millis(100))
    }

    /// Retry budget for transient partition faults.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts.max(1),
            initial_delay: parse_duration_or(&self.retry_initial_delay, Duration::from_millis(100)),
            max_delay: parse_duration_or(&self.retry_max_delay, Duration::from_secs(30)),
            backoff_factor: 2.0,
        }
    }

    /// Throttle configuration, `None` when throttling is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.throttle_enabled {
            Some(RateLimitConfig {
                burst_size: self.throttle_burst,
                refill_rate: self.throttle_rows_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OrchestratorSettings: phase gating
// ═══════════════════════════════════════════════════════════════════════════════

/// Migration orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Maximum stream lag allowed to enter or advance a phase.
    #[serde(default = "default_max_lag")]
    pub max_lag: String,

    /// How long to wait for streams to reach Running or a position.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: String,
}

fn default_max_lag() -> String {
    "10s".to_string()
}

fn default_wait_timeout() -> String {
    "5m".to_string()
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_lag: default_max_lag(),
            wait_timeout: default_wait_timeout(),
        }
    }
}

impl OrchestratorSettings {
    pub fn for_testing() -> Self {
        Self {
            max_lag: "10s".to_string(),
            wait_timeout: "10s".to_string(),
        }
    }

    pub fn max_lag_duration(&self) -> Duration {
        parse_duration_or(&self.max_lag, Duration::from_secs(10))
    }

    pub fn wait_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.wait_timeout, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: stream state persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Stream store persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding stream records.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "migrator_streams.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            wal_mode: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RouterSettings: query front-end view
// ═══════════════════════════════════════════════════════════════════════════════

/// Routing view settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// How often the routing view re-reads the topology store.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
}

fn default_refresh_interval() -> String {
    "1s".to_string()
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl RouterSettings {
    pub fn for_testing() -> Self {
        Self {
            refresh_interval: "10ms".to_string(),
        }
    }

    pub fn refresh_interval_duration(&self) -> Duration {
        parse_duration_or(&self.refresh_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
