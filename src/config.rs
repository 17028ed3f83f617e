//! Server and client configuration
//!
//! All durations are stored in milliseconds so the structs serialize
//! cleanly; accessor methods hand out `Duration`s.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for one server replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interval between `[Exercise] Tick` proposals on the leader.
    pub tick_interval_ms: u64,
    /// How long a proposal may wait for its commit before giving up.
    ///
    /// Retries of one request happen inside this window. They are only
    /// recognized as duplicates while fewer than `dedup_window` other
    /// requests have been applied since the first attempt, so size
    /// `dedup_window` for the request rate expected over this timeout.
    pub propose_timeout_ms: u64,
    /// Pause between retries while no leader is known.
    pub propose_retry_ms: u64,
    /// Number of applied request ids remembered for deduplication.
    ///
    /// Counted in entries rather than time so every replica evicts the same
    /// ids. A request id older than the window is executed again.
    pub dedup_window: usize,
    pub pending_exercises: PendingExercisePolicy,
    pub persistence: PersistencePolicy,
    pub raft: RaftConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            propose_timeout_ms: 5_000,
            propose_retry_ms: 100,
            dedup_window: 4_096,
            pending_exercises: PendingExercisePolicy::default(),
            persistence: PersistencePolicy::default(),
            raft: RaftConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Self =
            serde_json::from_slice(&data).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        if self.dedup_window == 0 {
            return Err(ConfigError::Invalid("dedup_window must be positive".into()));
        }
        self.raft.validate()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn propose_retry(&self) -> Duration {
        Duration::from_millis(self.propose_retry_ms)
    }
}

/// Bounds on joins that arrive before their exercise has been applied
/// locally.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingExercisePolicy {
    /// Maximum number of joins waiting at once.
    pub capacity: usize,
    /// How long a join waits for its exercise to appear.
    pub ttl_ms: u64,
}

impl Default for PendingExercisePolicy {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_ms: 5_000,
        }
    }
}

impl PendingExercisePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Where and how often dirty exercises are written out.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistencePolicy {
    /// Directory for the file snapshot store. `None` keeps snapshots in memory.
    pub directory: Option<PathBuf>,
    pub save_interval_ms: u64,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            directory: None,
            save_interval_ms: 10_000,
        }
    }
}

impl PersistencePolicy {
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }
}

/// Consensus timing and log compaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Applied entries kept in the log before a snapshot compacts them.
    pub snapshot_threshold: u64,
    /// Upper bound on entries shipped in one append request.
    pub max_entries_per_message: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            snapshot_threshold: 1_000,
            max_entries_per_message: 64,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(ConfigError::Invalid(
                "election timeout range must be non-empty and positive".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be shorter than the election timeout".into(),
            ));
        }
        if self.max_entries_per_message == 0 {
            return Err(ConfigError::Invalid(
                "max_entries_per_message must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Settings for an optimistic exercise client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for a proposal response.
    pub propose_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            propose_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }
}
