//! Pipe protocol definitions and message types

use appworker_core::TaskErrorEnvelope;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Pipe protocol version, checked during the worker handshake
pub const PIPE_PROTOCOL_VERSION: u32 = 1;

/// Envelope for everything exchanged over the worker pipes
///
/// On the wire this is `{"type": "<kind>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PipeMessage {
    /// Supervisor asks the worker to run a request or a task
    Request(WorkerPipeRequest),

    /// Worker's terminal reply, or the head of a streamed reply
    Response(WorkerPipeResponse),

    /// One piece of a streamed response body
    StreamChunk(StreamChunk),

    /// Marks the end of a streamed response body
    StreamEnd(StreamEnd),

    /// Output the app printed
    StdoutChunk(StdoutChunk),

    /// Ask the other end to stop
    Shutdown(Shutdown),
}

impl PipeMessage {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            PipeMessage::Request(_) => "request",
            PipeMessage::Response(_) => "response",
            PipeMessage::StreamChunk(_) => "stream_chunk",
            PipeMessage::StreamEnd(_) => "stream_end",
            PipeMessage::StdoutChunk(_) => "stdout_chunk",
            PipeMessage::Shutdown(_) => "shutdown",
        }
    }

    /// Execution id this message belongs to, if any
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            PipeMessage::Request(request) => Some(&request.id),
            PipeMessage::Response(response) => Some(&response.id),
            PipeMessage::StreamChunk(chunk) => Some(&chunk.request_id),
            PipeMessage::StreamEnd(end) => Some(&end.request_id),
            PipeMessage::StdoutChunk(chunk) => chunk.request_id.as_deref(),
            PipeMessage::Shutdown(_) => None,
        }
    }
}

/// Whether a request targets the HTTP-style handler or the task handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Request,
    Task,
}

/// Work sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPipeRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub timestamp: DateTime<Utc>,
    pub data: RequestData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log_filepath: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_filepath: Option<PathBuf>,
}

impl WorkerPipeRequest {
    /// Build an HTTP-style request envelope
    pub fn http(id: impl Into<String>, request: SerializableRequest) -> Self {
        Self::with_data(id.into(), RequestKind::Request, RequestData::Http(request))
    }

    /// Build a task envelope
    pub fn task(id: impl Into<String>, task: TaskPayload) -> Self {
        Self::with_data(id.into(), RequestKind::Task, RequestData::Task(task))
    }

    fn with_data(id: String, kind: RequestKind, data: RequestData) -> Self {
        Self {
            id,
            kind,
            timestamp: Utc::now(),
            data,
            auth_token: None,
            app_identifier: None,
            output_log_filepath: None,
            error_log_filepath: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_app_identifier(mut self, app_identifier: impl Into<String>) -> Self {
        self.app_identifier = Some(app_identifier.into());
        self
    }

    pub fn with_log_files(mut self, output: impl Into<PathBuf>, error: impl Into<PathBuf>) -> Self {
        self.output_log_filepath = Some(output.into());
        self.error_log_filepath = Some(error.into());
        self
    }

    /// True when `kind` and `data` agree
    pub fn is_consistent(&self) -> bool {
        matches!(
            (self.kind, &self.data),
            (RequestKind::Request, RequestData::Http(_)) | (RequestKind::Task, RequestData::Task(_))
        )
    }
}

/// Request body: an HTTP-like request or a task payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestData {
    Http(SerializableRequest),
    Task(TaskPayload),
}

/// HTTP-like request that survives JSON serialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl SerializableRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Task payload handed to the app's task handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub identifier: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl TaskPayload {
    pub fn new(identifier: impl Into<String>, data: JsonValue) -> Self {
        Self {
            identifier: identifier.into(),
            data,
        }
    }
}

/// Worker reply for one request id
///
/// `response` and `error` both absent means the handler produced nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPipeResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<SerializableResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorEnvelope>,
}

impl WorkerPipeResponse {
    pub fn ok(id: impl Into<String>, response: SerializableResponse) -> Self {
        Self {
            id: id.into(),
            response: Some(response),
            error: None,
        }
    }

    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            response: None,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: TaskErrorEnvelope) -> Self {
        Self {
            id: id.into(),
            response: None,
            error: Some(error),
        }
    }

    /// True when the body follows as stream chunks
    pub fn is_streaming(&self) -> bool {
        self.response.as_ref().is_some_and(SerializableResponse::is_streaming)
    }
}

/// HTTP-like response that survives JSON serialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializableResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_streaming: Option<bool>,
}

impl SerializableResponse {
    pub fn is_streaming(&self) -> bool {
        self.is_streaming.unwrap_or(false)
    }
}

/// One base64-encoded piece of a streamed body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub request_id: String,
    pub chunk: String,
    pub chunk_index: u64,
}

impl StreamChunk {
    pub fn encode(request_id: impl Into<String>, chunk_index: u64, bytes: &[u8]) -> Self {
        Self {
            request_id: request_id.into(),
            chunk: BASE64.encode(bytes),
            chunk_index,
        }
    }

    pub fn decode_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.chunk.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnd {
    pub request_id: String,
    pub total_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdoutChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub chunk: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shutdown {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// First line a worker writes after start, proving it holds the spawn token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHandshake {
    pub protocol_version: u32,
    pub worker_identifier: String,
    pub token: String,
    pub pid: u32,
}

impl WorkerHandshake {
    pub fn new(worker_identifier: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            protocol_version: PIPE_PROTOCOL_VERSION,
            worker_identifier: worker_identifier.into(),
            token: token.into(),
            pid: std::process::id(),
        }
    }
}

/// Start context handed to a worker process as its first argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStartContext {
    pub worker_identifier: String,
    pub app_identifier: String,
    pub worker_token: String,
    pub server_base_url: String,
    pub script_path: PathBuf,
    pub execution_id: String,
    pub worker_hash: String,
}

impl WorkerStartContext {
    pub fn to_arg(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_arg(arg: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(arg)
    }
}
