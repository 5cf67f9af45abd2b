//! Worker execution configuration

use crate::error::ConfigResult;
use crate::validation::{validate_file_name, validate_path, validate_positive, validate_url, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Worker execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// How long a freshly spawned worker has to complete its handshake
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_readiness_timeout")]
    pub readiness_timeout: Duration,

    /// Deadline for a single execution once the request has been sent
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_execution_timeout")]
    pub execution_timeout: Duration,

    /// Time a worker gets to exit after a shutdown message before it is killed
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_shutdown_grace_period")]
    pub shutdown_grace_period: Duration,

    /// Root of the per-execution log directories
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,

    /// Root of the deployed worker artifacts, laid out as `<app>/<worker>/<hash>/`
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,

    /// Base URL workers use to call back into the server
    #[serde(default = "default_server_base_url")]
    pub server_base_url: String,

    /// Executable name used when the worker config does not name one
    #[serde(default = "default_entrypoint")]
    pub default_entrypoint: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: default_readiness_timeout(),
            execution_timeout: default_execution_timeout(),
            shutdown_grace_period: default_shutdown_grace_period(),
            log_root: default_log_root(),
            artifact_root: default_artifact_root(),
            server_base_url: default_server_base_url(),
            default_entrypoint: default_entrypoint(),
        }
    }
}

impl Validatable for ExecutionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.readiness_timeout.as_secs(),
            "readiness_timeout",
            self.domain_name(),
        )?;

        validate_positive(
            self.execution_timeout.as_secs(),
            "execution_timeout",
            self.domain_name(),
        )?;

        validate_positive(
            self.shutdown_grace_period.as_secs(),
            "shutdown_grace_period",
            self.domain_name(),
        )?;

        validate_path(&self.log_root, "log_root", self.domain_name())?;
        validate_path(&self.artifact_root, "artifact_root", self.domain_name())?;
        validate_url(&self.server_base_url, "server_base_url", self.domain_name())?;
        validate_file_name(&self.default_entrypoint, "default_entrypoint", self.domain_name())?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution"
    }
}

// Default value functions
fn default_readiness_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_execution_timeout() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_log_root() -> PathBuf {
    std::env::temp_dir().join("appworker").join("logs")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("/var/lib/appworker/artifacts")
}

fn default_server_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_entrypoint() -> String {
    "worker".to_string()
}
