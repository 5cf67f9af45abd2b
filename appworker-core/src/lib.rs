//! Core types shared by the host and worker sides of the app-worker channel
//!
//! The only logic living here is error classification: turning whatever an
//! app handler failed with into a bounded [`TaskErrorEnvelope`] tagged with its
//! origin.

pub mod app_error;

pub use app_error::{
    classify, classify_value, AppTaskError, ErrorCause, ErrorOrigin, InvalidErrorDetails,
    TaskErrorEnvelope, APP_TASK_ERROR, APP_THREW_INVALID_APP_TASK_ERROR, INTERNAL_ERROR,
    INVALID_APP_TASK_ERROR, MAX_FIELD_CHARS, MAX_STACK_CHARS,
};
