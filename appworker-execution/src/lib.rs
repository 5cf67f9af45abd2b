//! App worker execution
//!
//! This crate runs platform-initiated system requests and tasks inside app
//! worker processes. A [`SystemRequestExecutor`] resolves the deployed build of
//! a worker, keeps one long-lived daemon per build, and multiplexes executions
//! over its pipe by execution id. Each execution walks a small state machine
//! (see [`ExecutionState`]) from spawn to a terminal state, and its reply is
//! translated into a [`SystemRequestResult`] or [`TaskOutcome`].

pub mod context;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod logs;
pub mod lookup;
pub mod options;
pub mod result;
pub mod state;
pub mod stream;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use context::{ExecutionContext, WorkerIdentity};
pub use daemon::{DaemonLauncher, PendingDaemon, ProcessExit, ProcessLauncher, WorkerDaemon};
pub use error::{ExecutionError, TimeoutPhase};
pub use executor::{
    internal_request, SystemRequestExecutor, SystemRequestParams, TaskParams,
    SYSTEM_REQUEST_ORIGIN,
};
pub use lookup::{StaticExecConfigLookup, WorkerExecConfig, WorkerExecConfigLookup};
pub use options::{ExecutionOptions, InvocationOptions, OutputSink, StdoutLine};
pub use result::{error_result, translate_reply, translate_response, SystemRequestResult, TaskOutcome};
pub use state::{ExecutionState, StateMachine};
pub use stream::{StreamAssembler, StreamIntegrityError};
pub use supervisor::{ExecutionReport, WorkerSupervisor};
