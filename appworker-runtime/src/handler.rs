//! The API app code implements

use appworker_core::{classify, classify_value, AppTaskError, TaskErrorEnvelope};
use appworker_ipc::{PipeMessage, SerializableRequest, StdoutChunk, TaskPayload};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

/// What an app handler failed with, already classified
///
/// Anything converts into a `Thrown`: an [`AppTaskError`] stays structured,
/// other values end up as an invalid AppTaskError carrying the original value.
#[derive(Debug, Clone, PartialEq)]
pub struct Thrown(TaskErrorEnvelope);

impl Thrown {
    /// Throw an arbitrary value
    pub fn value<T: Serialize + ?Sized>(thrown: &T) -> Self {
        Self(classify(thrown))
    }

    pub fn envelope(&self) -> &TaskErrorEnvelope {
        &self.0
    }

    pub fn into_envelope(self) -> TaskErrorEnvelope {
        self.0
    }
}

impl From<AppTaskError> for Thrown {
    fn from(err: AppTaskError) -> Self {
        Self(err.to_envelope())
    }
}

impl From<JsonValue> for Thrown {
    fn from(value: JsonValue) -> Self {
        Self(classify_value(&value))
    }
}

/// Body of a handler response
pub enum ResponseBody {
    Empty,
    Text(String),
    /// Sent as `stream_chunk` messages after the response head
    Stream(BoxStream<'static, Vec<u8>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Text(text) => f.debug_tuple("Text").field(text).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// HTTP-like response returned by [`WorkerHandler::handle_request`]
#[derive(Debug)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl HandlerResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            body: ResponseBody::Text(body.into()),
            ..Self::new(status)
        }
        .with_header("content-type", "text/plain; charset=utf-8")
    }

    pub fn json<T: Serialize + ?Sized>(status: u16, body: &T) -> Result<Self, Thrown> {
        let body = serde_json::to_string(body)
            .map_err(|e| AppTaskError::new("RESPONSE_NOT_SERIALIZABLE", e.to_string()))?;
        Ok(Self {
            body: ResponseBody::Text(body),
            ..Self::new(status)
        }
        .with_header("content-type", "application/json"))
    }

    pub fn stream<S>(status: u16, chunks: S) -> Self
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        Self {
            body: ResponseBody::Stream(chunks.boxed()),
            ..Self::new(status)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Canonical reason phrase for the status, empty when unknown
    pub fn status_text(&self) -> String {
        http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or_default()
            .to_string()
    }
}

/// Forwards text the app prints to the supervisor
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    execution_id: String,
    outbound: mpsc::UnboundedSender<PipeMessage>,
}

impl WorkerOutput {
    pub(crate) fn new(
        execution_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<PipeMessage>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            outbound,
        }
    }

    pub fn print(&self, text: impl Into<String>) {
        // Nobody left to read it once the runtime has stopped
        let _ = self.outbound.send(PipeMessage::StdoutChunk(StdoutChunk {
            request_id: Some(self.execution_id.clone()),
            chunk: text.into(),
        }));
    }
}

/// Per-execution data handed to handlers
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub execution_id: String,
    pub app_identifier: String,
    pub worker_identifier: String,
    pub worker_hash: String,
    /// Token for calling back into the server on behalf of this execution
    pub auth_token: Option<String>,
    pub server_base_url: String,
    pub output: WorkerOutput,
}

/// App code served by [`crate::WorkerRuntime`]
///
/// Both methods default to failing with an AppTaskError, so a worker only
/// implements the entry points it supports.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    async fn handle_request(
        &self,
        context: RequestContext,
        request: SerializableRequest,
    ) -> Result<HandlerResponse, Thrown> {
        let _ = (context, request);
        Err(AppTaskError::new("REQUEST_HANDLER_MISSING", "Worker does not handle requests").into())
    }

    /// Run a task; a returned response becomes the task result
    async fn handle_task(
        &self,
        context: RequestContext,
        task: TaskPayload,
    ) -> Result<Option<HandlerResponse>, Thrown> {
        let _ = context;
        Err(AppTaskError::new(
            "TASK_HANDLER_MISSING",
            format!("Worker does not handle task {}", task.identifier),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appworker_core::{ErrorOrigin, APP_TASK_ERROR, APP_THREW_INVALID_APP_TASK_ERROR};
    use serde_json::json;

    #[test]
    fn test_thrown_conversions() {
        let thrown: Thrown = AppTaskError::new("QUOTA", "Over quota").into();
        assert_eq!(thrown.envelope().code, APP_TASK_ERROR);
        assert_eq!(thrown.envelope().cause.code, "QUOTA");

        let thrown = Thrown::value("just a string");
        assert_eq!(thrown.envelope().code, APP_THREW_INVALID_APP_TASK_ERROR);
        assert_eq!(thrown.envelope().origin(), ErrorOrigin::App);

        let thrown = Thrown::from(json!({"name": "AppTaskError", "code": "X", "message": "m"}));
        assert!(thrown.into_envelope().is_valid_app_error());
    }

    #[test]
    fn test_response_builders() {
        let response = HandlerResponse::text(200, "ok").with_header("X-Trace", "1");
        assert_eq!(response.status_text(), "OK");
        assert_eq!(response.headers.get("x-trace").map(String::as_str), Some("1"));
        assert!(matches!(response.body, ResponseBody::Text(ref body) if body == "ok"));

        let response = HandlerResponse::json(201, &json!({"id": 7})).unwrap();
        assert_eq!(response.status_text(), "Created");
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );

        assert_eq!(HandlerResponse::new(599).status_text(), "");
    }
}
