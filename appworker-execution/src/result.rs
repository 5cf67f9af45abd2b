//! Translation of worker replies into caller-facing results

use appworker_core::TaskErrorEnvelope;
use appworker_ipc::{SerializableResponse, WorkerPipeResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::stream::StreamIntegrityError;

/// HTTP-like result handed back to the caller of a system request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRequestResult {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// What a task produced
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The handler returned normally, with or without a response
    Completed(Option<SystemRequestResult>),
    /// The handler threw; the envelope is already classified
    AppError(TaskErrorEnvelope),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn app_error(&self) -> Option<&TaskErrorEnvelope> {
        match self {
            TaskOutcome::AppError(envelope) => Some(envelope),
            TaskOutcome::Completed(_) => None,
        }
    }

    /// Requeue hint from a valid app error
    pub fn requeue_delay(&self) -> Option<Duration> {
        self.app_error().and_then(TaskErrorEnvelope::requeue_delay)
    }
}

/// Build a result from a response head and, when streaming, its assembled body
pub fn translate_response(
    response: SerializableResponse,
    streamed_body: Option<Vec<u8>>,
) -> Result<SystemRequestResult, StreamIntegrityError> {
    let body = match (response.is_streaming(), streamed_body) {
        (true, Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        (true, None) => return Err(StreamIntegrityError::Incomplete),
        (false, Some(_)) => return Err(StreamIntegrityError::BodyAndStream),
        (false, None) => response.body.unwrap_or_default(),
    };

    Ok(SystemRequestResult {
        status: response.status,
        status_text: response.status_text,
        headers: response.headers,
        body,
    })
}

/// Turn a full worker reply into a task outcome
pub fn translate_reply(
    reply: WorkerPipeResponse,
    streamed_body: Option<Vec<u8>>,
) -> Result<TaskOutcome, StreamIntegrityError> {
    if let Some(error) = reply.error {
        return Ok(TaskOutcome::AppError(error));
    }

    match reply.response {
        Some(response) => Ok(TaskOutcome::Completed(Some(translate_response(
            response,
            streamed_body,
        )?))),
        None if streamed_body.is_some() => Err(StreamIntegrityError::BodyAndStream),
        None => Ok(TaskOutcome::Completed(None)),
    }
}

/// 500 result carrying an app error from a system request
pub fn error_result(envelope: &TaskErrorEnvelope) -> SystemRequestResult {
    let body = serde_json::to_string(envelope).unwrap_or_else(|_| envelope.message.clone());

    SystemRequestResult {
        status: 500,
        status_text: "Internal Server Error".to_string(),
        headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
        body,
    }
}
