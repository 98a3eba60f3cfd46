//! Queue configuration.
//!
//! Every tunable has a default, so an empty YAML document (or no file at
//! all) yields a working configuration. Durations are written as integer
//! seconds or milliseconds, as the key suffix says.

use crate::queue::domain::{BackoffPolicy, MAX_ATTEMPTS_LIMIT, TaskType, TaskTypeRegistry};
use crate::queue::strategy::{ClaimStrategy, DEFAULT_WEIGHTED_WINDOW, StrategyKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The YAML did not match the configuration schema.
    #[error("invalid config syntax: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range or inconsistent with another.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Durable store settings.
    pub storage: StorageConfig,
    /// Lease timing.
    pub lease: LeaseConfig,
    /// Retry backoff.
    pub retry: RetryConfig,
    /// Worker idle polling.
    pub poll: PollConfig,
    /// Claim strategy selection.
    pub strategy: StrategyConfig,
    /// Enqueue validation rules.
    pub tasks: TasksConfig,
    /// Background housekeeping.
    pub maintenance: MaintenanceConfig,
}

/// Durable store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// Per-connection lock wait before SQLite reports busy.
    pub busy_timeout_ms: u64,
    /// Transaction attempts before a busy store is reported.
    pub busy_retries: u32,
    /// First delay between busy retries; doubles per attempt.
    pub busy_retry_base_ms: u64,
    /// Page cache size per connection.
    pub cache_size_kib: u32,
    /// Page size applied when the database file is created.
    pub page_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("leasehold.db"),
            pool_size: 8,
            busy_timeout_ms: 5_000,
            busy_retries: 5,
            busy_retry_base_ms: 20,
            cache_size_kib: 8_192,
            page_size: 4_096,
        }
    }
}

impl StorageConfig {
    /// Returns a default configuration pointing at `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Returns the busy timeout.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Returns the backoff applied between busy retries.
    #[must_use]
    pub fn busy_backoff(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.busy_retry_base_ms);
        BackoffPolicy::new(base, 2, base.saturating_mul(64))
    }
}

/// Lease timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    /// Lease length granted by a claim or heartbeat.
    pub duration_secs: u64,
    /// How often a running worker renews its lease.
    pub heartbeat_interval_secs: u64,
    /// A worker silent for longer than this is considered dead.
    pub heartbeat_staleness_secs: u64,
    /// Leases expired for longer than this are reclaimed even from live
    /// workers.
    pub orphan_grace_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 300,
            heartbeat_interval_secs: 30,
            heartbeat_staleness_secs: 120,
            orphan_grace_secs: 3_600,
        }
    }
}

impl LeaseConfig {
    /// Returns the lease length.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Returns the worker staleness threshold.
    #[must_use]
    pub const fn heartbeat_staleness(&self) -> Duration {
        Duration::from_secs(self.heartbeat_staleness_secs)
    }

    /// Returns the orphan grace period.
    #[must_use]
    pub const fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

/// Retry backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub base_delay_ms: u64,
    /// Growth factor per further failure.
    pub multiplier: u32,
    /// Delay cap.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2,
            max_delay_ms: 600_000,
        }
    }
}

impl RetryConfig {
    /// Builds the backoff policy.
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Worker idle polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    /// Sleep after the first empty poll.
    pub min_interval_ms: u64,
    /// Cap on the idle sleep.
    pub max_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            max_interval_ms: 5_000,
        }
    }
}

impl PollConfig {
    /// Returns the first idle sleep.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Returns the idle sleep cap.
    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Claim strategy selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyConfig {
    /// Strategy to run.
    pub kind: StrategyKind,
    /// Candidate window for weighted random selection.
    pub window: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::default(),
            window: DEFAULT_WEIGHTED_WINDOW,
        }
    }
}

impl StrategyConfig {
    /// Builds the configured strategy.
    #[must_use]
    pub fn build(&self) -> Arc<dyn ClaimStrategy> {
        self.kind.build(self.window)
    }
}

/// Enqueue validation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksConfig {
    /// Attempt budget for requests that do not set one.
    pub default_max_attempts: u32,
    /// Lowest accepted priority.
    pub priority_min: i32,
    /// Highest accepted priority.
    pub priority_max: i32,
    /// Accepted task types; empty accepts any well-formed type.
    pub allowed_types: Vec<String>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            priority_min: 0,
            priority_max: 1_000,
            allowed_types: Vec::new(),
        }
    }
}

impl TasksConfig {
    /// Builds the task type registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed type name.
    pub fn registry(&self) -> Result<TaskTypeRegistry, ConfigError> {
        self.allowed_types.iter().try_fold(
            TaskTypeRegistry::new()
                .with_priority_range(self.priority_min, self.priority_max)
                .with_default_max_attempts(self.default_max_attempts),
            |registry, name| {
                TaskType::new(name.as_str())
                    .map(|task_type| registry.with_type(task_type))
                    .map_err(|err| ConfigError::Invalid(err.to_string()))
            },
        )
    }
}

/// Background housekeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Terminal tasks and log rows older than this are pruned.
    pub retention_hours: u64,
    /// Expired-lease sweep interval.
    pub reclaim_interval_secs: u64,
    /// Prune interval.
    pub prune_interval_secs: u64,
    /// WAL checkpoint interval.
    pub checkpoint_interval_secs: u64,
    /// Directory for backup snapshots; unset disables backups.
    pub backup_dir: Option<PathBuf>,
    /// Backup interval.
    pub backup_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_hours: 168,
            reclaim_interval_secs: 30,
            prune_interval_secs: 3_600,
            checkpoint_interval_secs: 300,
            backup_dir: None,
            backup_interval_secs: 86_400,
        }
    }
}

impl MaintenanceConfig {
    /// Returns the retention window.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3_600))
    }

    /// Returns the reclaim interval.
    #[must_use]
    pub const fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    /// Returns the prune interval.
    #[must_use]
    pub const fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    /// Returns the checkpoint interval.
    #[must_use]
    pub const fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Returns the backup interval.
    #[must_use]
    pub const fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }
}

impl QueueConfig {
    /// Loads and validates a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parses and validates YAML text. Blank input yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.storage.pool_size == 0, "storage.pool_size must be at least 1"),
            (self.storage.busy_retries == 0, "storage.busy_retries must be at least 1"),
            (self.lease.duration_secs == 0, "lease.duration_secs must be positive"),
            (
                self.lease.heartbeat_interval_secs == 0
                    || self.lease.heartbeat_interval_secs >= self.lease.duration_secs,
                "lease.heartbeat_interval_secs must be positive and shorter than lease.duration_secs",
            ),
            (self.retry.multiplier == 0, "retry.multiplier must be at least 1"),
            (
                self.poll.min_interval_ms == 0
                    || self.poll.min_interval_ms > self.poll.max_interval_ms,
                "poll.min_interval_ms must be positive and not exceed poll.max_interval_ms",
            ),
            (self.strategy.window == 0, "strategy.window must be at least 1"),
            (
                self.tasks.default_max_attempts == 0
                    || self.tasks.default_max_attempts > MAX_ATTEMPTS_LIMIT,
                "tasks.default_max_attempts must be between 1 and 2147483647",
            ),
            (
                self.tasks.priority_min > self.tasks.priority_max,
                "tasks.priority_min must not exceed tasks.priority_max",
            ),
        ];
        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(ConfigError::Invalid((*message).to_owned()));
        }
        self.tasks.registry().map(|_| ())
    }
}
