//! Error types for worker execution

use appworker_core::TaskErrorEnvelope;
use appworker_ipc::{IpcError, ProtocolDecodeError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::state::ExecutionState;
use crate::stream::StreamIntegrityError;

/// Phase an execution was in when its deadline elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for the worker handshake
    AwaitingReady,
    /// Waiting for the response
    Running,
    /// Waiting for the rest of a streamed body
    Draining,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::AwaitingReady => write!(f, "waiting for the worker to become ready"),
            TimeoutPhase::Running => write!(f, "waiting for the worker response"),
            TimeoutPhase::Draining => write!(f, "waiting for the streamed body"),
        }
    }
}

/// Worker execution errors
///
/// Every variant is fatal to the execution it was raised for. Errors the app
/// itself threw are not represented here; they come back as data.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Worker handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Execution timed out {phase} after {}ms", .after.as_millis())]
    TimedOut {
        phase: TimeoutPhase,
        after: Duration,
        process_terminated: bool,
    },

    /// The worker went away on its own
    #[error("Worker process exited before responding (exit code {exit_code:?})")]
    WorkerCrashed { exit_code: Option<i32> },

    /// The host stopped the worker while this execution was in flight,
    /// e.g. because another execution on it timed out
    #[error("Worker process was stopped before responding: {reason}")]
    WorkerTerminated { reason: String },

    #[error("Stream integrity error: {0}")]
    StreamIntegrity(#[from] StreamIntegrityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolDecodeError),

    #[error("IPC error: {0}")]
    Ipc(String),

    /// Worker could not be resolved; details stay in the logs
    #[error("Unexpected error")]
    Resolution {
        app_identifier: String,
        worker_identifier: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid execution state transition from {from:?} to {to:?}")]
    InvalidState {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::TimedOut { .. })
    }

    /// Whether the worker process was terminated because of this error
    pub fn process_terminated(&self) -> bool {
        matches!(
            self,
            ExecutionError::TimedOut {
                process_terminated: true,
                ..
            }
        )
    }

    /// Platform-side envelope for callers that only speak [`TaskErrorEnvelope`]
    pub fn to_envelope(&self) -> TaskErrorEnvelope {
        TaskErrorEnvelope::internal(self.to_string())
    }
}

impl From<IpcError> for ExecutionError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Decode(decode) => ExecutionError::Protocol(decode),
            IpcError::ConnectionClosed => ExecutionError::WorkerCrashed { exit_code: None },
            other => ExecutionError::Ipc(other.to_string()),
        }
    }
}
