//! Per-invocation options

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Caller-controlled execution flags
///
/// Unknown keys are ignored so callers can pass their whole options bag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Log every stdout chunk the worker forwards
    pub print_worker_output: bool,
    /// Delete the execution's log directory once it finishes
    pub remove_worker_directory: bool,
}

impl ExecutionOptions {
    pub fn from_json(value: &JsonValue) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Self::deserialize(value)
    }
}

/// One stdout chunk forwarded by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdoutLine {
    pub execution_id: Uuid,
    pub chunk: String,
}

/// Receives worker stdout as it arrives
pub trait OutputSink: Send + Sync {
    fn on_stdout(&self, execution_id: Uuid, chunk: &str);
}

impl OutputSink for mpsc::UnboundedSender<StdoutLine> {
    fn on_stdout(&self, execution_id: Uuid, chunk: &str) {
        let _ = self.send(StdoutLine {
            execution_id,
            chunk: chunk.to_string(),
        });
    }
}

/// Options for a single `run_system_request` / `run_task` call
#[derive(Clone, Default)]
pub struct InvocationOptions {
    pub options: ExecutionOptions,
    pub stdout_sink: Option<Arc<dyn OutputSink>>,
    pub cancel: Option<CancellationToken>,
}

impl InvocationOptions {
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn with_stdout_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for InvocationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationOptions")
            .field("options", &self.options)
            .field("stdout_sink", &self.stdout_sink.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}
