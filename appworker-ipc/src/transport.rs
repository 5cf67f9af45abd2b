//! Pipe transport halves
//!
//! The supervisor and the worker each hold a [`PipeReader`] and a
//! [`PipeWriter`]. They are split so that one task can block on reads while
//! others keep writing.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::codec::{self, MAX_MESSAGE_BYTES};
use crate::error::{IpcError, ProtocolDecodeError};
use crate::protocol::{PipeMessage, WorkerHandshake};

/// Outbound half of a pipe
#[async_trait]
pub trait MessageSink: Send {
    /// Send a message to the other end
    async fn send(&mut self, message: &PipeMessage) -> Result<(), IpcError>;

    /// Close the pipe
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Inbound half of a pipe
#[async_trait]
pub trait MessageSource: Send {
    /// Receive the next message, `None` once the other end has closed
    async fn receive(&mut self) -> Result<Option<PipeMessage>, IpcError>;
}

/// Writes newline-delimited messages
pub struct PipeWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> PipeWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Underlying writer, for output that bypasses the codec
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Write the worker handshake line
    pub async fn send_handshake(&mut self, handshake: &WorkerHandshake) -> Result<(), IpcError> {
        let bytes = codec::encode_handshake(handshake)?;
        self.write_line(&bytes).await
    }

    async fn write_line(&mut self, bytes: &[u8]) -> Result<(), IpcError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for PipeWriter<W> {
    async fn send(&mut self, message: &PipeMessage) -> Result<(), IpcError> {
        let bytes = codec::encode(message)?;
        self.write_line(&bytes).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Reads newline-delimited messages with a bounded line length
pub struct PipeReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    max_line_bytes: usize,
}

impl<R: AsyncRead + Unpin + Send> PipeReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_MESSAGE_BYTES)
    }

    pub fn with_limit(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
            max_line_bytes,
        }
    }

    /// Read the worker handshake line
    pub async fn receive_handshake(&mut self) -> Result<WorkerHandshake, IpcError> {
        if !self.next_line().await? {
            return Err(IpcError::ConnectionClosed);
        }
        codec::decode_handshake(&self.line)
    }

    /// Fill `self.line` with the next non-blank line; false on EOF
    async fn next_line(&mut self) -> Result<bool, IpcError> {
        loop {
            self.line.clear();
            let limit = self.max_line_bytes as u64 + 1;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.line)
                .await?;

            if read == 0 {
                return Ok(false);
            }
            if self.line.last() != Some(&b'\n') && self.line.len() > self.max_line_bytes {
                return Err(ProtocolDecodeError::LineTooLong {
                    limit: self.max_line_bytes,
                }
                .into());
            }
            if !self.line.trim_ascii().is_empty() {
                return Ok(true);
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for PipeReader<R> {
    async fn receive(&mut self) -> Result<Option<PipeMessage>, IpcError> {
        if !self.next_line().await? {
            return Ok(None);
        }
        Ok(Some(codec::decode(&self.line)?))
    }
}

/// Pipe pair of the current process, used by workers
pub fn stdio_pipes() -> (PipeReader<tokio::io::Stdin>, PipeWriter<tokio::io::Stdout>) {
    (
        PipeReader::new(tokio::io::stdin()),
        PipeWriter::new(tokio::io::stdout()),
    )
}
