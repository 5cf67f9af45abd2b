//! Configuration loading and environment variable handling

use crate::domains::execution::ExecutionConfig;
use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::AppWorkerConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate_enum_choice;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "APPWORKER".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<AppWorkerConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppWorkerConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<AppWorkerConfig> {
        let mut config = AppWorkerConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<AppWorkerConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut AppWorkerConfig) -> ConfigResult<()> {
        self.apply_execution_overrides(&mut config.execution)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply execution config overrides
    fn apply_execution_overrides(&self, config: &mut ExecutionConfig) -> ConfigResult<()> {
        if let Some(timeout) = self.get_seconds("READINESS_TIMEOUT_SECONDS")? {
            config.readiness_timeout = timeout;
        }

        if let Some(timeout) = self.get_seconds("EXECUTION_TIMEOUT_SECONDS")? {
            config.execution_timeout = timeout;
        }

        if let Some(grace) = self.get_seconds("SHUTDOWN_GRACE_SECONDS")? {
            config.shutdown_grace_period = grace;
        }

        if let Ok(log_root) = self.get_env_var("LOG_ROOT") {
            config.log_root = PathBuf::from(log_root);
        }

        if let Ok(artifact_root) = self.get_env_var("ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(artifact_root);
        }

        if let Ok(base_url) = self.get_env_var("SERVER_BASE_URL") {
            config.server_base_url = base_url;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            validate_enum_choice(&format, &LogFormat::CHOICES, "LOG_FORMAT", "logging")
                .map_err(|e| ConfigError::EnvError(e.to_string()))?;
            config.format = LogFormat::from_str(&format).map_err(ConfigError::EnvError)?;
        }

        Ok(())
    }

    fn get_seconds(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => {
                let seconds: u64 = value
                    .parse()
                    .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
                Ok(Some(Duration::from_secs(seconds)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
