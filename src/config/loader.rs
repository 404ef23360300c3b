//! Configuration Loader
//!
//! Environment-aware loading: discovers the base and environment YAML files in
//! the configuration directory and layers environment variables on top.

use super::error::{ConfigResult, ConfigurationError};
use super::WorkflowEngineConfig;
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_STEM: &str = "storage-workflows";
const ENV_PREFIX: &str = "STORAGE_WORKFLOWS";

/// Loaded configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: WorkflowEngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Tests use this to avoid touching process environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&config)
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = %environment,
            task_queue = %config.worker.task_queue,
            max_concurrent_activities = config.worker.max_concurrent_activities,
            history_backend = ?config.history.backend,
            "⚙️ CONFIG: Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Build a manager around an already constructed configuration
    pub fn from_config(config: WorkflowEngineConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: Self::default_config_directory(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &WorkflowEngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect the current environment
    pub fn detect_environment() -> String {
        crate::logging::get_environment()
    }

    fn default_config_directory() -> PathBuf {
        std::env::var("STORAGE_WORKFLOWS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<WorkflowEngineConfig> {
        if !config_directory.is_dir() {
            return Err(ConfigurationError::DirectoryNotFound {
                path: config_directory.to_path_buf(),
            });
        }

        let base_path = config_directory.join(format!("{BASE_FILE_STEM}.yaml"));
        let env_path = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.yaml"));

        debug!(
            base = %base_path.display(),
            base_exists = base_path.exists(),
            overrides = %env_path.display(),
            overrides_exist = env_path.exists(),
            "Resolving configuration sources"
        );

        let merged = Config::builder()
            .add_source(File::from(base_path).format(FileFormat::Yaml).required(false))
            .add_source(File::from(env_path).format(FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(merged.try_deserialize::<WorkflowEngineConfig>()?)
    }
}
