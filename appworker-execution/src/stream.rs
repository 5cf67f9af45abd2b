//! Reassembly of streamed response bodies

use appworker_ipc::{StreamChunk, StreamEnd};
use std::collections::BTreeMap;
use thiserror::Error;

/// A streamed body that cannot be reassembled faithfully
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamIntegrityError {
    #[error("chunk for {actual} arrived on stream {expected}")]
    WrongRequest { expected: String, actual: String },

    #[error("chunk {index} was delivered twice")]
    DuplicateChunk { index: u64 },

    #[error("chunk {index} is not valid base64")]
    InvalidEncoding { index: u64 },

    #[error("chunk {index} is missing")]
    MissingChunk { index: u64 },

    #[error("chunk {index} is beyond the {total} announced chunks")]
    ChunkOutOfRange { index: u64, total: u64 },

    #[error("stream_end arrived before the response head")]
    EndBeforeResponse,

    #[error("a second response arrived for the same execution")]
    DuplicateResponse,

    #[error("response carries both a body and stream chunks")]
    BodyAndStream,

    #[error("streaming response finished without its body")]
    Incomplete,
}

/// Collects the chunks of one streamed body
///
/// Chunks may arrive in any order; the body is produced in index order once
/// `stream_end` confirms the count.
#[derive(Debug)]
pub struct StreamAssembler {
    request_id: String,
    chunks: BTreeMap<u64, Vec<u8>>,
    bytes: usize,
}

impl StreamAssembler {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            chunks: BTreeMap::new(),
            bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &StreamChunk) -> Result<(), StreamIntegrityError> {
        self.check_request(&chunk.request_id)?;

        if self.chunks.contains_key(&chunk.chunk_index) {
            return Err(StreamIntegrityError::DuplicateChunk {
                index: chunk.chunk_index,
            });
        }

        let bytes = chunk
            .decode_bytes()
            .map_err(|_| StreamIntegrityError::InvalidEncoding {
                index: chunk.chunk_index,
            })?;

        self.bytes += bytes.len();
        self.chunks.insert(chunk.chunk_index, bytes);
        Ok(())
    }

    pub fn received(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    /// Concatenate the body once the end marker arrived
    pub fn finish(self, end: &StreamEnd) -> Result<Vec<u8>, StreamIntegrityError> {
        self.check_request(&end.request_id)?;

        let total = end.total_chunks;
        if let Some((&index, _)) = self.chunks.range(total..).next() {
            return Err(StreamIntegrityError::ChunkOutOfRange { index, total });
        }
        // Every index is below `total` now, so a short count means a gap
        if self.received() != total {
            let index = (0..=self.received())
                .find(|index| !self.chunks.contains_key(index))
                .unwrap_or(self.received());
            return Err(StreamIntegrityError::MissingChunk { index });
        }

        let mut body = Vec::with_capacity(self.bytes);
        for chunk in self.chunks.into_values() {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn check_request(&self, request_id: &str) -> Result<(), StreamIntegrityError> {
        if request_id != self.request_id {
            return Err(StreamIntegrityError::WrongRequest {
                expected: self.request_id.clone(),
                actual: request_id.to_string(),
            });
        }
        Ok(())
    }
}
