//! IPC error types

use thiserror::Error;

/// Failure to turn bytes read from the pipe into a [`crate::PipeMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolDecodeError {
    /// Nothing but whitespace was read
    #[error("Empty message")]
    Empty,

    /// Input ended in the middle of a message
    #[error("Truncated message: {0}")]
    Truncated(String),

    /// Input is not a well-formed envelope
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Envelope parsed but its payload breaks a protocol invariant
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A single line exceeded the framing limit
    #[error("Message exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

impl From<serde_json::Error> for ProtocolDecodeError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() {
            ProtocolDecodeError::Truncated(err.to_string())
        } else {
            ProtocolDecodeError::Malformed(err.to_string())
        }
    }
}

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Decoding error
    #[error("Decode error: {0}")]
    Decode(#[from] ProtocolDecodeError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },
}

impl IpcError {
    /// Check if this error leaves the channel unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ProtocolVersionMismatch { .. }
                | IpcError::Decode(_)
                | IpcError::ConnectionClosed
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}
