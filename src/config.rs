//! Configuration for the replication engine.
//!
//! Configuration is passed to
//! [`ReplicationController::open()`](crate::coordinator::ReplicationController::open)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use index_replication::config::{ReplicationConfig, CheckpointConfig};
//!
//! let config = ReplicationConfig {
//!     node_id: "follower-node-1".into(),
//!     checkpoint: CheckpointConfig::sqlite("/var/lib/replication/checkpoints.db"),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── node_id: String                # This node's ID (logging only)
//! ├── shard: ShardTaskConfig         # Fetch/apply loop of each shard task
//! ├── index: IndexTaskConfig         # Supervision of shard tasks
//! ├── autofollow: AutoFollowConfig   # Pattern-based discovery
//! └── checkpoint: CheckpointConfig   # Checkpoint persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "follower-node-1"
//!
//! shard:
//!   ops_batch_size: 512
//!   poll_interval: "1s"
//!   fetch_timeout: "60s"
//!
//! index:
//!   shard_restart_delay: "5s"
//!
//! autofollow:
//!   poll_interval: "30s"
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/replication/checkpoints.db"
//!   flush_interval: "1s"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RetryConfig, ThrottleConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime duration, falling back to `default` on bad input.
fn parse_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

fn check_duration(field: &str, value: &str) -> Result<()> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| ReplicationError::Config(format!("invalid duration for {}: {:?} ({})", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationController::open()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationController::open()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identity of the follower node running this engine. Used in logs.
    pub node_id: String,

    /// Shard task (fetch/apply loop) settings.
    #[serde(default)]
    pub shard: ShardTaskConfig,

    /// Index task (supervisor) settings.
    #[serde(default)]
    pub index: IndexTaskConfig,

    /// Auto-follow discovery settings.
    #[serde(default)]
    pub autofollow: AutoFollowConfig,

    /// Checkpoint persistence settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            shard: ShardTaskConfig::default(),
            index: IndexTaskConfig::default(),
            autofollow: AutoFollowConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a config with short timings and in-memory checkpoints, for tests.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            shard: ShardTaskConfig::for_testing(),
            index: IndexTaskConfig::for_testing(),
            autofollow: AutoFollowConfig::for_testing(),
            checkpoint: CheckpointConfig::in_memory(),
        }
    }

    /// Reject durations that do not parse and zero-sized limits.
    pub fn validate(&self) -> Result<()> {
        check_duration("shard.poll_interval", &self.shard.poll_interval)?;
        check_duration("shard.fetch_timeout", &self.shard.fetch_timeout)?;
        check_duration("shard.apply_timeout", &self.shard.apply_timeout)?;
        check_duration("shard.retry_initial_delay", &self.shard.retry_initial_delay)?;
        check_duration("shard.retry_max_delay", &self.shard.retry_max_delay)?;
        check_duration("index.shard_restart_delay", &self.index.shard_restart_delay)?;
        check_duration("index.drain_timeout", &self.index.drain_timeout)?;
        check_duration("index.restore_wait_timeout", &self.index.restore_wait_timeout)?;
        check_duration("autofollow.poll_interval", &self.autofollow.poll_interval)?;
        check_duration("checkpoint.flush_interval", &self.checkpoint.flush_interval)?;

        if self.shard.ops_batch_size == 0 {
            return Err(ReplicationError::Config("shard.ops_batch_size must be > 0".into()));
        }
        if self.shard.max_concurrent_fetches == 0 {
            return Err(ReplicationError::Config(
                "shard.max_concurrent_fetches must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ShardTaskConfig: fetch/apply loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Shard task configuration.
///
/// `ops_batch_size` and `poll_interval` are defaults; the index setting
/// overrides in [`crate::settings`] take precedence per index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardTaskConfig {
    /// Maximum operations requested per leader fetch.
    #[serde(default = "default_ops_batch_size")]
    pub ops_batch_size: usize,

    /// Sleep between fetches once a shard has caught up with the leader.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Bound on a single leader fetch call.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: String,

    /// Bound on a single follower apply call.
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout: String,

    /// Engine-wide cap on in-flight leader fetches.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Consecutive transient failures tolerated before a shard fails.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (thundering herd prevention on mass resume)
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting of leader fetch requests.
    #[serde(default = "default_false")]
    pub fetch_rate_limit_enabled: bool,

    /// Sustained leader fetches per second across all shards.
    #[serde(default = "default_fetch_rate_limit_per_sec")]
    pub fetch_rate_limit_per_sec: u32,

    /// Burst allowance above the sustained rate.
    #[serde(default = "default_fetch_rate_limit_burst")]
    pub fetch_rate_limit_burst: u32,
}

fn default_ops_batch_size() -> usize {
    512
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_fetch_timeout() -> String {
    "60s".to_string()
}

fn default_apply_timeout() -> String {
    "60s".to_string()
}

fn default_max_concurrent_fetches() -> usize {
    64
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

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_fetch_rate_limit_per_sec() -> u32 {
    1000
}

fn default_fetch_rate_limit_burst() -> u32 {
    100
}

impl Default for ShardTaskConfig {
    fn default() -> Self {
        Self {
            ops_batch_size: 512,
            poll_interval: "1s".to_string(),
            fetch_timeout: "60s".to_string(),
            apply_timeout: "60s".to_string(),
            max_concurrent_fetches: 64,
            retry_max_attempts: 10,
            retry_initial_delay: "100ms".to_string(),
            retry_max_delay: "30s".to_string(),
            fetch_rate_limit_enabled: false,
            fetch_rate_limit_per_sec: 1000,
            fetch_rate_limit_burst: 100,
        }
    }
}

impl ShardTaskConfig {
    /// Fast timings for tests.
    pub fn for_testing() -> Self {
        Self {
            ops_batch_size: 64,
            poll_interval: "20ms".to_string(),
            fetch_timeout: "2s".to_string(),
            apply_timeout: "2s".to_string(),
            max_concurrent_fetches: 16,
            retry_max_attempts: 5,
            retry_initial_delay: "10ms".to_string(),
            retry_max_delay: "100ms".to_string(),
            ..Default::default()
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(1))
    }

    pub fn fetch_timeout_duration(&self) -> Duration {
        parse_or(&self.fetch_timeout, Duration::from_secs(60))
    }

    pub fn apply_timeout_duration(&self) -> Duration {
        parse_or(&self.apply_timeout, Duration::from_secs(60))
    }

    /// Backoff policy for transient shard errors.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts.max(1),
            initial_delay: parse_or(&self.retry_initial_delay, Duration::from_millis(100)),
            max_delay: parse_or(&self.retry_max_delay, Duration::from_secs(30)),
            backoff_factor: 2.0,
        }
    }

    /// Fetch throttle, `None` if disabled.
    pub fn throttle_config(&self) -> Option<ThrottleConfig> {
        self.fetch_rate_limit_enabled.then(|| ThrottleConfig {
            per_second: self.fetch_rate_limit_per_sec,
            burst: self.fetch_rate_limit_burst,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IndexTaskConfig: shard supervision
// ═══════════════════════════════════════════════════════════════════════════════

/// Index task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTaskConfig {
    /// Delay before a killed shard task is restarted from its checkpoint.
    #[serde(default = "default_shard_restart_delay")]
    pub shard_restart_delay: String,

    /// How long to wait for shard tasks to exit after cancellation
    /// before aborting them.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Upper bound for `start(.., wait_for_restore = true)`.
    #[serde(default = "default_restore_wait_timeout")]
    pub restore_wait_timeout: String,
}

fn default_shard_restart_delay() -> String {
    "5s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

fn default_restore_wait_timeout() -> String {
    "60s".to_string()
}

impl Default for IndexTaskConfig {
    fn default() -> Self {
        Self {
            shard_restart_delay: "5s".to_string(),
            drain_timeout: "10s".to_string(),
            restore_wait_timeout: "60s".to_string(),
        }
    }
}

impl IndexTaskConfig {
    pub fn for_testing() -> Self {
        Self {
            shard_restart_delay: "100ms".to_string(),
            drain_timeout: "2s".to_string(),
            restore_wait_timeout: "5s".to_string(),
        }
    }

    pub fn shard_restart_delay_duration(&self) -> Duration {
        parse_or(&self.shard_restart_delay, Duration::from_secs(5))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(10))
    }

    pub fn restore_wait_timeout_duration(&self) -> Duration {
        parse_or(&self.restore_wait_timeout, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AutoFollowConfig: pattern-based discovery
// ═══════════════════════════════════════════════════════════════════════════════

/// Auto-follow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFollowConfig {
    /// Whether the background poller runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often each leader alias is listed for new indices.
    #[serde(default = "default_autofollow_poll_interval")]
    pub poll_interval: String,
}

fn default_autofollow_poll_interval() -> String {
    "30s".to_string()
}

impl Default for AutoFollowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: "30s".to_string(),
        }
    }
}

impl AutoFollowConfig {
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            poll_interval: "50ms".to_string(),
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: checkpoint persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
///
/// Without a SQLite path checkpoints live in memory and a process restart
/// loses them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    #[serde(default)]
    pub sqlite_path: Option<String>,

    /// How often dirty checkpoints are flushed to SQLite.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "1s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: Some("replication_checkpoints.db".to_string()),
            flush_interval: "1s".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// Keep checkpoints in memory only.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: None,
            flush_interval: "1s".to_string(),
        }
    }

    /// Persist checkpoints to a SQLite file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        parse_or(&self.flush_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
