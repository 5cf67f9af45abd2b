//! Newline-delimited JSON codec for [`PipeMessage`]
//!
//! Every message is a single JSON object terminated by `\n`. The `type` field
//! makes each line self-describing, so requests, responses and stdout
//! forwarding share one channel without extra framing.

use crate::error::{IpcError, ProtocolDecodeError};
use crate::protocol::{PipeMessage, WorkerHandshake, PIPE_PROTOCOL_VERSION};

/// Upper bound for a single encoded message
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Encode a message as one newline-terminated line
pub fn encode(message: &PipeMessage) -> Result<Vec<u8>, IpcError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one line into a message, enforcing payload invariants
pub fn decode(bytes: &[u8]) -> Result<PipeMessage, ProtocolDecodeError> {
    let line = bytes.trim_ascii();
    if line.is_empty() {
        return Err(ProtocolDecodeError::Empty);
    }

    let message: PipeMessage = serde_json::from_slice(line)?;
    validate(&message)?;
    Ok(message)
}

pub fn encode_handshake(handshake: &WorkerHandshake) -> Result<Vec<u8>, IpcError> {
    let mut bytes = serde_json::to_vec(handshake)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode the worker handshake line and check the protocol version
pub fn decode_handshake(bytes: &[u8]) -> Result<WorkerHandshake, IpcError> {
    let line = bytes.trim_ascii();
    if line.is_empty() {
        return Err(ProtocolDecodeError::Empty.into());
    }

    let handshake: WorkerHandshake =
        serde_json::from_slice(line).map_err(ProtocolDecodeError::from)?;

    if handshake.protocol_version != PIPE_PROTOCOL_VERSION {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: PIPE_PROTOCOL_VERSION,
            actual: handshake.protocol_version,
        });
    }

    Ok(handshake)
}

fn validate(message: &PipeMessage) -> Result<(), ProtocolDecodeError> {
    match message {
        PipeMessage::Request(request) => {
            require_id(&request.id, "request")?;
            if !request.is_consistent() {
                return Err(ProtocolDecodeError::InvalidPayload(format!(
                    "request {} has type {:?} but carries the other kind of data",
                    request.id, request.kind
                )));
            }
        }
        PipeMessage::Response(response) => {
            require_id(&response.id, "response")?;
            if let Some(inner) = &response.response {
                if inner.is_streaming() && inner.body.is_some() {
                    return Err(ProtocolDecodeError::InvalidPayload(format!(
                        "streaming response {} must not carry a body",
                        response.id
                    )));
                }
            }
        }
        PipeMessage::StreamChunk(chunk) => require_id(&chunk.request_id, "stream_chunk")?,
        PipeMessage::StreamEnd(end) => require_id(&end.request_id, "stream_end")?,
        PipeMessage::StdoutChunk(_) | PipeMessage::Shutdown(_) => {}
    }
    Ok(())
}

fn require_id(id: &str, kind: &str) -> Result<(), ProtocolDecodeError> {
    if id.is_empty() {
        return Err(ProtocolDecodeError::InvalidPayload(format!(
            "{} is missing its id",
            kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;
    use appworker_core::AppTaskError;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_messages() -> Vec<PipeMessage> {
        vec![
            PipeMessage::Request(
                WorkerPipeRequest::http("exec-1", SerializableRequest::new("GET", "/x"))
                    .with_auth_token("tok")
                    .with_log_files("/tmp/out.log", "/tmp/err.log"),
            ),
            PipeMessage::Request(WorkerPipeRequest::task(
                "exec-2",
                TaskPayload::new("sync", json!({"folder": 7})),
            )),
            PipeMessage::Response(WorkerPipeResponse::ok(
                "exec-1",
                SerializableResponse {
                    status: 200,
                    status_text: "OK".to_string(),
                    headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
                    body: Some("ok".to_string()),
                    url: "http://appworker.internal/x".to_string(),
                    is_streaming: None,
                },
            )),
            PipeMessage::Response(WorkerPipeResponse::failed(
                "exec-2",
                AppTaskError::new("CODE", "msg").to_envelope(),
            )),
            PipeMessage::StreamChunk(StreamChunk::encode("exec-3", 0, b"part")),
            PipeMessage::StreamEnd(StreamEnd {
                request_id: "exec-3".to_string(),
                total_chunks: 1,
            }),
            PipeMessage::StdoutChunk(StdoutChunk {
                request_id: Some("exec-3".to_string()),
                chunk: "log line\n".to_string(),
            }),
            PipeMessage::Shutdown(Shutdown {
                reason: Some("cancelled".to_string()),
            }),
        ]
    }

    #[test]
    fn test_encode_decode_every_kind() {
        for message in sample_messages() {
            let bytes = encode(&message).unwrap();
            assert_eq!(bytes.last(), Some(&b'\n'));
            assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, message, "kind {}", message.kind());
        }
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode(b"  \n"), Err(ProtocolDecodeError::Empty));
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = encode(&sample_messages()[0]).unwrap();
        let cut = &bytes[..bytes.len() / 2];
        assert!(matches!(decode(cut), Err(ProtocolDecodeError::Truncated(_))));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode(b"not json"), Err(ProtocolDecodeError::Malformed(_))));
        assert!(matches!(
            decode(br#"{"type":"teleport","payload":{}}"#),
            Err(ProtocolDecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"stream_end","payload":{"requestId":"a"}}"#),
            Err(ProtocolDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_mismatched_request_kind() {
        let line = json!({
            "type": "request",
            "payload": {
                "id": "exec-1",
                "type": "task",
                "timestamp": "2024-01-01T00:00:00Z",
                "data": {"method": "GET", "url": "/x"}
            }
        })
        .to_string();

        assert!(matches!(
            decode(line.as_bytes()),
            Err(ProtocolDecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_rejects_streaming_response_with_body() {
        let line = json!({
            "type": "response",
            "payload": {
                "id": "exec-1",
                "response": {"status": 200, "body": "x", "isStreaming": true}
            }
        })
        .to_string();

        assert!(matches!(
            decode(line.as_bytes()),
            Err(ProtocolDecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        let line = br#"{"type":"stream_chunk","payload":{"requestId":"","chunk":"","chunkIndex":0}}"#;
        assert!(matches!(decode(line), Err(ProtocolDecodeError::InvalidPayload(_))));
    }

    #[test]
    fn test_handshake_version_check() {
        let mut handshake = WorkerHandshake::new("worker", "tok");
        let bytes = encode_handshake(&handshake).unwrap();
        assert_eq!(decode_handshake(&bytes).unwrap(), handshake);

        handshake.protocol_version = PIPE_PROTOCOL_VERSION + 1;
        let bytes = encode_handshake(&handshake).unwrap();
        assert!(matches!(
            decode_handshake(&bytes),
            Err(IpcError::ProtocolVersionMismatch { .. })
        ));
    }
}
