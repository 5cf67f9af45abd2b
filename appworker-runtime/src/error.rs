//! Runtime error types

use appworker_ipc::IpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Missing worker start context argument")]
    MissingStartContext,

    #[error("Invalid worker start context: {0}")]
    InvalidStartContext(#[from] serde_json::Error),

    #[error("Pipe error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Pipe writer stopped: {0}")]
    Writer(String),
}
