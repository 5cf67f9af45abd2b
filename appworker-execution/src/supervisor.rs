//! Execution lifecycle on top of a worker daemon

use appworker_config::ExecutionConfig;
use appworker_ipc::{PipeMessage, ProtocolDecodeError, WorkerPipeRequest, WorkerPipeResponse, WorkerStartContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{generate_token, ExecutionContext, WorkerIdentity};
use crate::daemon::{DaemonLauncher, WorkerDaemon};
use crate::error::ExecutionError;
use crate::logs::ExecutionLogs;
use crate::options::InvocationOptions;
use crate::state::{ExecutionState, StateMachine};
use crate::stream::{StreamAssembler, StreamIntegrityError};

/// How long to wait for an exit status after the channel closed
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);

/// Terminal reply of a successful execution
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub reply: WorkerPipeResponse,
    /// Reassembled body when the reply was streamed
    pub streamed_body: Option<Vec<u8>>,
    pub elapsed: Duration,
}

/// Runs executions for one worker identity
pub struct WorkerSupervisor {
    identity: WorkerIdentity,
    script_path: PathBuf,
    config: ExecutionConfig,
    launcher: Arc<dyn DaemonLauncher>,
    daemon: Mutex<Option<Arc<WorkerDaemon>>>,
}

impl WorkerSupervisor {
    pub fn new(
        identity: WorkerIdentity,
        script_path: impl Into<PathBuf>,
        config: ExecutionConfig,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> Self {
        Self {
            identity,
            script_path: script_path.into(),
            config,
            launcher,
            daemon: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Whether a ready daemon is currently running
    pub async fn has_live_daemon(&self) -> bool {
        self.daemon
            .lock()
            .await
            .as_ref()
            .is_some_and(|daemon| daemon.is_alive())
    }

    /// Run one request to completion
    pub async fn execute(
        &self,
        context: &ExecutionContext,
        request: WorkerPipeRequest,
        invocation: &InvocationOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        let started = Instant::now();
        let mut machine = StateMachine::new(context.execution_id);

        let mut logs = match ExecutionLogs::create(context).await {
            Ok(logs) => logs,
            Err(e) => {
                let err = ExecutionError::Io(e);
                machine.fail(&err);
                return Err(err);
            }
        };

        let result = self
            .drive(&mut machine, context, request, invocation, cancel, &mut logs)
            .await;

        if let Err(e) = logs.flush().await {
            warn!(
                "Failed to flush logs of execution {}: {}",
                context.execution_id, e
            );
        }

        match result {
            Ok((reply, streamed_body)) => {
                info!(
                    execution_id = %context.execution_id,
                    worker = %self.identity,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Execution completed"
                );
                Ok(ExecutionReport {
                    execution_id: context.execution_id,
                    reply,
                    streamed_body,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                machine.fail(&e);
                warn!(
                    execution_id = %context.execution_id,
                    worker = %self.identity,
                    state = %machine.state(),
                    "Execution failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Stop the daemon, if any, giving it the grace period to exit
    pub async fn shutdown(&self) {
        let daemon = self.daemon.lock().await.take();
        if let Some(daemon) = daemon {
            daemon
                .shutdown(self.config.shutdown_grace_period, "supervisor shutting down")
                .await;
        }
    }

    async fn drive(
        &self,
        machine: &mut StateMachine,
        context: &ExecutionContext,
        request: WorkerPipeRequest,
        invocation: &InvocationOptions,
        cancel: &CancellationToken,
        logs: &mut ExecutionLogs,
    ) -> Result<(WorkerPipeResponse, Option<Vec<u8>>), ExecutionError> {
        machine.transition(ExecutionState::Spawning)?;

        let daemon = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            daemon = self.ready_daemon(machine, context) => daemon?,
        };

        let execution_id = context.id();
        let mut route = daemon.register(&execution_id)?;
        machine.transition(ExecutionState::Running)?;
        daemon.send(PipeMessage::Request(request))?;

        let deadline = Instant::now() + self.config.execution_timeout;
        let mut head: Option<WorkerPipeResponse> = None;
        let mut assembler: Option<StreamAssembler> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    daemon
                        .shutdown(
                            self.config.shutdown_grace_period,
                            &format!("execution {} cancelled", execution_id),
                        )
                        .await;
                    return Err(ExecutionError::Cancelled);
                }
                next = tokio::time::timeout_at(deadline, route.recv()) => next,
            };

            let message = match next {
                Err(_) => {
                    warn!(
                        "Execution {} exceeded {:?}, terminating worker {}",
                        execution_id, self.config.execution_timeout, self.identity
                    );
                    let process_terminated = daemon
                        .kill(&format!("execution {} timed out", execution_id))
                        .await;
                    return Err(ExecutionError::TimedOut {
                        phase: machine.state().timeout_phase(),
                        after: self.config.execution_timeout,
                        process_terminated,
                    });
                }
                Ok(None) => {
                    if daemon.termination_reason().is_none() {
                        daemon.wait_for_exit(EXIT_STATUS_WAIT).await;
                    }
                    return Err(daemon.unavailable());
                }
                Ok(Some(Err(decode))) => return Err(ExecutionError::Protocol(decode)),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                PipeMessage::StdoutChunk(chunk) => {
                    self.forward_stdout(context, &chunk.chunk, invocation, logs).await;
                }
                PipeMessage::Response(reply) => {
                    if head.is_some() {
                        return Err(StreamIntegrityError::DuplicateResponse.into());
                    }
                    if reply.is_streaming() {
                        machine.transition(ExecutionState::Draining)?;
                        head = Some(reply);
                    } else {
                        if assembler.is_some() {
                            return Err(StreamIntegrityError::BodyAndStream.into());
                        }
                        machine.transition(ExecutionState::Completed)?;
                        return Ok((reply, None));
                    }
                }
                PipeMessage::StreamChunk(chunk) => {
                    assembler
                        .get_or_insert_with(|| StreamAssembler::new(execution_id.clone()))
                        .push(&chunk)?;
                }
                PipeMessage::StreamEnd(end) => {
                    let Some(reply) = head.take() else {
                        return Err(StreamIntegrityError::EndBeforeResponse.into());
                    };
                    let body = assembler
                        .take()
                        .unwrap_or_else(|| StreamAssembler::new(execution_id.clone()))
                        .finish(&end)?;
                    machine.transition(ExecutionState::Completed)?;
                    return Ok((reply, Some(body)));
                }
                other => {
                    return Err(ExecutionError::Protocol(ProtocolDecodeError::InvalidPayload(
                        format!("worker sent {} for execution {}", other.kind(), execution_id),
                    )));
                }
            }
        }
    }

    /// Reuse the live daemon or start a new one
    async fn ready_daemon(
        &self,
        machine: &mut StateMachine,
        context: &ExecutionContext,
    ) -> Result<Arc<WorkerDaemon>, ExecutionError> {
        let mut slot = self.daemon.lock().await;

        if let Some(daemon) = slot.as_ref() {
            if daemon.is_alive() {
                machine.transition(ExecutionState::AwaitingReady)?;
                return Ok(daemon.clone());
            }
            debug!("Replacing stopped daemon for worker {}", self.identity);
            *slot = None;
        }

        let start = WorkerStartContext {
            worker_identifier: self.identity.worker_identifier.clone(),
            app_identifier: self.identity.app_identifier.clone(),
            worker_token: generate_token(),
            server_base_url: self.config.server_base_url.clone(),
            script_path: self.script_path.clone(),
            execution_id: context.id(),
            worker_hash: self.identity.worker_hash.clone(),
        };

        let pending = self.launcher.launch(&self.identity, &start)?;
        machine.transition(ExecutionState::AwaitingReady)?;
        let daemon = pending.await_ready(self.config.readiness_timeout).await?;

        *slot = Some(daemon.clone());
        Ok(daemon)
    }

    async fn forward_stdout(
        &self,
        context: &ExecutionContext,
        chunk: &str,
        invocation: &InvocationOptions,
        logs: &mut ExecutionLogs,
    ) {
        if invocation.options.print_worker_output {
            info!(
                execution_id = %context.execution_id,
                worker = %self.identity,
                "{}",
                chunk.trim_end()
            );
        }
        if let Some(sink) = &invocation.stdout_sink {
            sink.on_stdout(context.execution_id, chunk);
        }
        if let Err(e) = logs.append_stdout(chunk).await {
            warn!(
                "Failed to write stdout log of execution {}: {}",
                context.execution_id, e
            );
        }
    }
}
