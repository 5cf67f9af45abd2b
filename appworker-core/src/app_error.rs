//! App error classification
//!
//! App handlers are untrusted: they may fail with a well-formed
//! [`AppTaskError`] or with any other value. [`classify`] validates the thrown
//! value and produces a [`TaskErrorEnvelope`] whose size is bounded and whose
//! cause is tagged with its origin. Classification never fails; anything it
//! cannot make sense of lands in the "invalid" branch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;
use thiserror::Error;

/// Envelope code for a well-formed app error
pub const APP_TASK_ERROR: &str = "APP_TASK_ERROR";

/// Envelope code for an app that failed with something other than an AppTaskError
pub const APP_THREW_INVALID_APP_TASK_ERROR: &str = "APP_THREW_INVALID_APP_TASK_ERROR";

/// Cause code used for invalid app errors
pub const INVALID_APP_TASK_ERROR: &str = "INVALID_APP_TASK_ERROR";

/// Envelope code for platform-side failures
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Bound applied to `name`, `code` and `message`
pub const MAX_FIELD_CHARS: usize = 256;

/// Bound applied to `stack`
pub const MAX_STACK_CHARS: usize = 2048;

const APP_TASK_ERROR_NAME: &str = "AppTaskError";
const INVALID_APP_TASK_ERROR_NAME: &str = "InvalidAppTaskError";
const INTERNAL_ERROR_NAME: &str = "InternalError";
const UNSERIALIZABLE_PLACEHOLDER: &str = "[unserializable error]";

/// Structured error an app raises on purpose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{name} ({code}): {message}")]
pub struct AppTaskError {
    pub name: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<JsonValue>,
}

impl AppTaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: APP_TASK_ERROR_NAME.to_string(),
            code: code.into(),
            message: message.into(),
            stack: None,
            requeue_delay_ms: None,
            cause: None,
        }
    }

    /// Ask the caller to requeue the task after `delay`
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_cause(mut self, cause: JsonValue) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Classify this error into its transport envelope
    pub fn to_envelope(&self) -> TaskErrorEnvelope {
        classify(self)
    }
}

/// Where an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOrigin {
    App,
    Internal,
}

/// Details attached when an app failed with an invalid error value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidErrorDetails {
    pub original_error: JsonValue,
    pub validation_error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCause {
    pub origin: ErrorOrigin,
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<InvalidErrorDetails>,
}

/// Transportable, size-bounded error returned to callers as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct TaskErrorEnvelope {
    pub code: String,
    pub message: String,
    pub cause: ErrorCause,
}

impl TaskErrorEnvelope {
    /// Envelope for a platform-side failure; carries no app details
    pub fn internal(message: impl Into<String>) -> Self {
        let message = truncate(&message.into(), MAX_FIELD_CHARS);
        Self {
            code: INTERNAL_ERROR.to_string(),
            message: message.clone(),
            cause: ErrorCause {
                origin: ErrorOrigin::Internal,
                name: INTERNAL_ERROR_NAME.to_string(),
                code: INTERNAL_ERROR.to_string(),
                message: Some(message),
                stack: None,
                requeue_delay_ms: None,
                details: None,
            },
        }
    }

    pub fn origin(&self) -> ErrorOrigin {
        self.cause.origin
    }

    /// True when the app raised a well-formed AppTaskError
    pub fn is_valid_app_error(&self) -> bool {
        self.code == APP_TASK_ERROR && self.cause.origin == ErrorOrigin::App
    }

    /// Requeue hint supplied by the app, if any
    pub fn requeue_delay(&self) -> Option<Duration> {
        self.cause.requeue_delay_ms.map(Duration::from_millis)
    }
}

/// Classify any serializable thrown value
pub fn classify<T: Serialize + ?Sized>(thrown: &T) -> TaskErrorEnvelope {
    match serde_json::to_value(thrown) {
        Ok(value) => classify_value(&value),
        Err(e) => invalid(
            JsonValue::String(UNSERIALIZABLE_PLACEHOLDER.to_string()),
            format!("thrown value could not be serialized: {}", e),
        ),
    }
}

/// Classify a thrown value already in JSON form
pub fn classify_value(thrown: &JsonValue) -> TaskErrorEnvelope {
    match validate(thrown) {
        Ok(fields) => TaskErrorEnvelope {
            code: APP_TASK_ERROR.to_string(),
            message: "App threw an AppTaskError".to_string(),
            cause: ErrorCause {
                origin: ErrorOrigin::App,
                name: truncate(fields.name, MAX_FIELD_CHARS),
                code: truncate(fields.code, MAX_FIELD_CHARS),
                message: Some(truncate(fields.message, MAX_FIELD_CHARS)),
                stack: fields.stack.map(|s| truncate(s, MAX_STACK_CHARS)),
                requeue_delay_ms: fields.requeue_delay_ms,
                details: None,
            },
        },
        Err(validation_error) => invalid(thrown.clone(), validation_error),
    }
}

struct ValidFields<'a> {
    name: &'a str,
    code: &'a str,
    message: &'a str,
    stack: Option<&'a str>,
    requeue_delay_ms: Option<u64>,
}

fn validate(thrown: &JsonValue) -> Result<ValidFields<'_>, String> {
    let object = thrown
        .as_object()
        .ok_or_else(|| format!("expected an object, got {}", json_type(thrown)))?;

    Ok(ValidFields {
        code: required_string(object, "code")?,
        name: required_string(object, "name")?,
        message: required_string(object, "message")?,
        stack: object.get("stack").and_then(JsonValue::as_str),
        requeue_delay_ms: requeue_delay(object)?,
    })
}

fn required_string<'a>(object: &'a Map<String, JsonValue>, field: &str) -> Result<&'a str, String> {
    match object.get(field) {
        Some(JsonValue::String(s)) => Ok(s),
        Some(other) => Err(format!("`{}` must be a string, got {}", field, json_type(other))),
        None => Err(format!("`{}` is required", field)),
    }
}

fn requeue_delay(object: &Map<String, JsonValue>) -> Result<Option<u64>, String> {
    const FIELD_ERROR: &str = "`requeueDelayMs` must be a non-negative integer";

    match object.get("requeueDelayMs") {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => {
            if let Some(ms) = n.as_u64() {
                return Ok(Some(ms));
            }
            // 5.0 is an integer as far as the app is concerned
            match n.as_f64() {
                Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
                    Ok(Some(f as u64))
                }
                _ => Err(FIELD_ERROR.to_string()),
            }
        }
        Some(_) => Err(FIELD_ERROR.to_string()),
    }
}

fn invalid(original_error: JsonValue, validation_error: String) -> TaskErrorEnvelope {
    TaskErrorEnvelope {
        code: APP_THREW_INVALID_APP_TASK_ERROR.to_string(),
        message: "App threw an invalid AppTaskError".to_string(),
        cause: ErrorCause {
            origin: ErrorOrigin::App,
            name: INVALID_APP_TASK_ERROR_NAME.to_string(),
            code: INVALID_APP_TASK_ERROR.to_string(),
            message: None,
            stack: None,
            requeue_delay_ms: None,
            details: Some(InvalidErrorDetails {
                original_error,
                validation_error,
            }),
        },
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}
