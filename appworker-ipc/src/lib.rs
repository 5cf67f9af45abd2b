//! Pipe protocol for app workers
//!
//! This crate defines the [`PipeMessage`] envelope exchanged between the
//! supervisor and a worker process, the newline-delimited JSON codec, and
//! the async reader/writer halves used on both ends of the pipe pair.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;

pub use codec::{decode, decode_handshake, encode, encode_handshake, MAX_MESSAGE_BYTES};
pub use error::{IpcError, ProtocolDecodeError};
pub use protocol::{
    PipeMessage, RequestData, RequestKind, SerializableRequest, SerializableResponse, Shutdown,
    StdoutChunk, StreamChunk, StreamEnd, TaskPayload, WorkerHandshake, WorkerPipeRequest,
    WorkerPipeResponse, WorkerStartContext, PIPE_PROTOCOL_VERSION,
};
pub use transport::{stdio_pipes, MessageSink, MessageSource, PipeReader, PipeWriter};
