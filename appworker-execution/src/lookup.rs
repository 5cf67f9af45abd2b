//! Resolution of deployed worker configuration

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::ExecutionError;

/// Deployment facts needed to start a worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerExecConfig {
    /// Content hash of the deployed build
    pub worker_hash: Option<String>,
    /// Executable inside the build directory; the configured default when absent
    pub entrypoint: Option<String>,
}

impl WorkerExecConfig {
    pub fn with_hash(hash: impl Into<String>) -> Self {
        Self {
            worker_hash: Some(hash.into()),
            entrypoint: None,
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }
}

/// Source of worker deployment configuration, provided by the host server
#[async_trait]
pub trait WorkerExecConfigLookup: Send + Sync {
    async fn get_worker_exec_config(
        &self,
        app_identifier: &str,
        worker_identifier: &str,
    ) -> Result<Option<WorkerExecConfig>, ExecutionError>;
}

/// In-memory lookup, used by the CLI and tests
#[derive(Debug, Default)]
pub struct StaticExecConfigLookup {
    entries: RwLock<HashMap<(String, String), WorkerExecConfig>>,
}

impl StaticExecConfigLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        app_identifier: impl Into<String>,
        worker_identifier: impl Into<String>,
        config: WorkerExecConfig,
    ) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert((app_identifier.into(), worker_identifier.into()), config);
    }
}

#[async_trait]
impl WorkerExecConfigLookup for StaticExecConfigLookup {
    async fn get_worker_exec_config(
        &self,
        app_identifier: &str,
        worker_identifier: &str,
    ) -> Result<Option<WorkerExecConfig>, ExecutionError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&(app_identifier.to_string(), worker_identifier.to_string()))
            .cloned())
    }
}
