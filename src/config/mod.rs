//! # Worker Configuration
//!
//! Layered configuration for the workflow runtime and the storage worker.
//!
//! Sources, lowest precedence first:
//!
//! 1. serde defaults on every section
//! 2. `config/storage-workflows.yaml`
//! 3. `config/storage-workflows.{environment}.yaml`
//! 4. environment variables prefixed `STORAGE_WORKFLOWS`, nested with `__`
//!    (`STORAGE_WORKFLOWS__WORKER__MAX_CONCURRENT_ACTIVITIES=32`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use storage_workflows::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let queue = &manager.config().worker.task_queue;
//! # Ok(())
//! # }
//! ```
//!
//! Coordination functions never read configuration. Anything a workflow decides
//! on has to come from its input or from recorded history.

pub mod error;
pub mod loader;

use crate::constants::{defaults, DEFAULT_TASK_QUEUE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring storage-workflows.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowEngineConfig {
    pub worker: WorkerConfig,
    pub history: HistoryConfig,
    pub job_wait: JobWaitConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub task_queue: String,
    /// Size of the activity worker pool
    pub max_concurrent_activities: usize,
    pub shutdown_grace_period_seconds: u64,
    /// Workflows started when the worker boots
    pub startup_workflows: Vec<StartupWorkflow>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            max_concurrent_activities: defaults::MAX_CONCURRENT_ACTIVITIES,
            shutdown_grace_period_seconds: defaults::SHUTDOWN_GRACE_PERIOD.as_secs(),
            startup_workflows: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartupWorkflow {
    pub workflow_type: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub backend: HistoryBackend,
    pub directory: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Memory,
            directory: PathBuf::from(defaults::HISTORY_DIRECTORY),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobWaitConfig {
    pub poll_interval_seconds: u64,
    /// Used when a wait request does not carry its own timeout
    pub default_timeout_seconds: u64,
}

impl Default for JobWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: defaults::JOB_POLL_INTERVAL.as_secs(),
            default_timeout_seconds: defaults::JOB_WAIT_TIMEOUT.as_secs(),
        }
    }
}

impl JobWaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Overrides the environment-derived level when set
    pub level: Option<String>,
}

impl WorkflowEngineConfig {
    /// Validate cross-field constraints after all sources are merged
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.task_queue.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "worker.task_queue",
                "",
                "task queue name must not be empty",
            ));
        }
        if self.worker.max_concurrent_activities == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.max_concurrent_activities",
                0,
                "at least one activity slot is required",
            ));
        }
        if self.job_wait.poll_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "job_wait.poll_interval_seconds",
                0,
                "poll interval must be positive",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                0,
                "broadcast channel capacity must be positive",
            ));
        }
        for startup in &self.worker.startup_workflows {
            if startup.workflow_type.trim().is_empty() {
                return Err(ConfigurationError::validation_error(
                    "startup workflow entry is missing workflow_type",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkflowEngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.task_queue, "netapp-activeiq-task-queue");
        assert_eq!(config.job_wait.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.job_wait.default_timeout(), Duration::from_secs(300));
        assert_eq!(config.history.backend, HistoryBackend::Memory);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let mut config = WorkflowEngineConfig::default();
        config.worker.max_concurrent_activities = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_activities"));
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let mut config = WorkflowEngineConfig::default();
        config.job_wait.poll_interval_seconds = 0;
        assert!(config.validate().is_err());
    }
}
