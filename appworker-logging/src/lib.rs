//! Tracing initialisation for app-worker binaries
//!
//! Everything in the workspace logs through `tracing`. Host binaries call
//! [`init_logging_from_config`]; worker processes call [`init_worker_tracing`],
//! which writes to stderr because stdout carries the pipe protocol.

pub mod init;

pub use init::{build_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing};
