//! Entry point for running system requests and tasks on app workers

use appworker_config::ExecutionConfig;
use appworker_ipc::{SerializableRequest, TaskPayload, WorkerPipeRequest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::context::{path_component, ExecutionContext, WorkerIdentity};
use crate::daemon::{DaemonLauncher, ProcessLauncher};
use crate::error::ExecutionError;
use crate::logs::remove_log_dir;
use crate::lookup::{WorkerExecConfig, WorkerExecConfigLookup};
use crate::options::InvocationOptions;
use crate::result::{error_result, translate_reply, SystemRequestResult, TaskOutcome};
use crate::supervisor::WorkerSupervisor;

/// Origin of the synthetic requests sent for system calls; never routable
pub const SYSTEM_REQUEST_ORIGIN: &str = "http://appworker.internal";

/// A platform-initiated HTTP-style request for a worker
#[derive(Debug, Clone)]
pub struct SystemRequestParams {
    pub app_identifier: String,
    pub worker_identifier: String,
    pub request: SerializableRequest,
}

/// A task for a worker's task handler
#[derive(Debug, Clone)]
pub struct TaskParams {
    pub app_identifier: String,
    pub worker_identifier: String,
    pub task: TaskPayload,
}

/// Runs system requests and tasks, keeping one daemon per deployed worker
pub struct SystemRequestExecutor {
    config: ExecutionConfig,
    lookup: Arc<dyn WorkerExecConfigLookup>,
    launcher: Arc<dyn DaemonLauncher>,
    pinned_hashes: RwLock<HashMap<(String, String), String>>,
    supervisors: Mutex<HashMap<WorkerIdentity, Arc<WorkerSupervisor>>>,
    shutdown: CancellationToken,
}

impl SystemRequestExecutor {
    pub fn new(config: ExecutionConfig, lookup: Arc<dyn WorkerExecConfigLookup>) -> Self {
        Self::with_launcher(config, lookup, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(
        config: ExecutionConfig,
        lookup: Arc<dyn WorkerExecConfigLookup>,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> Self {
        let mut config = config;
        // Workers run with their build directory as cwd
        config.artifact_root = absolute_path(&config.artifact_root);
        config.log_root = absolute_path(&config.log_root);

        Self {
            config,
            lookup,
            launcher,
            pinned_hashes: RwLock::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Use `worker_hash` for this worker regardless of what the lookup says
    pub fn pin_worker_hash(
        &self,
        app_identifier: impl Into<String>,
        worker_identifier: impl Into<String>,
        worker_hash: impl Into<String>,
    ) {
        let mut pinned = self.pinned_hashes.write().unwrap_or_else(|e| e.into_inner());
        pinned.insert(
            (app_identifier.into(), worker_identifier.into()),
            worker_hash.into(),
        );
    }

    pub fn unpin_worker_hash(&self, app_identifier: &str, worker_identifier: &str) {
        let mut pinned = self.pinned_hashes.write().unwrap_or_else(|e| e.into_inner());
        pinned.remove(&(app_identifier.to_string(), worker_identifier.to_string()));
    }

    /// Run a system request; app errors come back as a 500 result
    pub async fn run_system_request(
        &self,
        params: SystemRequestParams,
        invocation: InvocationOptions,
    ) -> Result<Option<SystemRequestResult>, ExecutionError> {
        let SystemRequestParams {
            app_identifier,
            worker_identifier,
            request,
        } = params;
        let request = internal_request(request)?;

        let outcome = self
            .execute(
                &app_identifier,
                &worker_identifier,
                |id| WorkerPipeRequest::http(id, request),
                invocation,
            )
            .await?;

        Ok(match outcome {
            TaskOutcome::Completed(result) => result,
            TaskOutcome::AppError(envelope) => Some(error_result(&envelope)),
        })
    }

    /// Run a task; app errors come back as [`TaskOutcome::AppError`]
    pub async fn run_task(
        &self,
        params: TaskParams,
        invocation: InvocationOptions,
    ) -> Result<TaskOutcome, ExecutionError> {
        let TaskParams {
            app_identifier,
            worker_identifier,
            task,
        } = params;

        self.execute(
            &app_identifier,
            &worker_identifier,
            |id| WorkerPipeRequest::task(id, task),
            invocation,
        )
        .await
    }

    /// Cancel in-flight executions and stop every daemon
    ///
    /// The executor refuses new work afterwards.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();

        let supervisors: Vec<Arc<WorkerSupervisor>> = {
            let mut supervisors = self.supervisors.lock().await;
            supervisors.drain().map(|(_, supervisor)| supervisor).collect()
        };

        info!("Stopping {} worker daemons", supervisors.len());
        futures::future::join_all(supervisors.iter().map(|supervisor| supervisor.shutdown())).await;
    }

    /// Number of workers with a live daemon
    pub async fn live_daemons(&self) -> usize {
        let supervisors: Vec<Arc<WorkerSupervisor>> =
            self.supervisors.lock().await.values().cloned().collect();

        let mut live = 0;
        for supervisor in supervisors {
            if supervisor.has_live_daemon().await {
                live += 1;
            }
        }
        live
    }

    async fn execute(
        &self,
        app_identifier: &str,
        worker_identifier: &str,
        build: impl FnOnce(String) -> WorkerPipeRequest,
        invocation: InvocationOptions,
    ) -> Result<TaskOutcome, ExecutionError> {
        if self.shutdown.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let (identity, script_path) = self.resolve(app_identifier, worker_identifier).await?;
        let supervisor = self.supervisor_for(&identity, &script_path).await;
        let context = ExecutionContext::new(
            identity,
            script_path,
            self.config.server_base_url.clone(),
            &self.config.log_root,
        );

        let request = build(context.id())
            .with_auth_token(context.auth_token.clone())
            .with_app_identifier(app_identifier)
            .with_log_files(
                context.stdout_log_path.clone(),
                context.stderr_log_path.clone(),
            );

        let cancel = self.shutdown.child_token();
        let _cancel_on_return = cancel.clone().drop_guard();
        if let Some(caller) = invocation.cancel.clone() {
            link_cancellation(caller, cancel.clone());
        }

        debug!(
            execution_id = %context.execution_id,
            worker = %context.identity,
            "Starting execution"
        );
        let report = supervisor
            .execute(&context, request, &invocation, &cancel)
            .await;

        if invocation.options.remove_worker_directory {
            remove_log_dir(&context.log_dir).await;
        }

        let report = report?;
        Ok(translate_reply(report.reply, report.streamed_body)?)
    }

    /// Resolve the deployed build and its executable
    async fn resolve(
        &self,
        app_identifier: &str,
        worker_identifier: &str,
    ) -> Result<(WorkerIdentity, PathBuf), ExecutionError> {
        let unresolved = || ExecutionError::Resolution {
            app_identifier: app_identifier.to_string(),
            worker_identifier: worker_identifier.to_string(),
        };

        let pinned = {
            let pinned = self.pinned_hashes.read().unwrap_or_else(|e| e.into_inner());
            pinned
                .get(&(app_identifier.to_string(), worker_identifier.to_string()))
                .cloned()
        };

        // A pinned hash only needs the lookup for its entrypoint
        let exec_config = match self
            .lookup
            .get_worker_exec_config(app_identifier, worker_identifier)
            .await
        {
            Ok(config) => config.unwrap_or_default(),
            Err(e) if pinned.is_some() => {
                warn!(
                    app_identifier,
                    worker_identifier, "Worker config lookup failed, using pinned hash: {}", e
                );
                WorkerExecConfig::default()
            }
            Err(e) => {
                error!(
                    app_identifier,
                    worker_identifier, "Worker config lookup failed: {}", e
                );
                return Err(unresolved());
            }
        };

        let Some(worker_hash) = pinned
            .or(exec_config.worker_hash)
            .filter(|hash| !hash.trim().is_empty())
        else {
            error!(
                app_identifier,
                worker_identifier, "No worker hash could be resolved"
            );
            return Err(unresolved());
        };

        let entrypoint = exec_config
            .entrypoint
            .unwrap_or_else(|| self.config.default_entrypoint.clone());
        let identity = WorkerIdentity::new(app_identifier, worker_identifier, worker_hash);
        let script_path = identity
            .artifact_dir(&self.config.artifact_root)
            .join(path_component(&entrypoint));

        Ok((identity, script_path))
    }

    /// Supervisor for `identity`, retiring daemons of superseded hashes
    async fn supervisor_for(
        &self,
        identity: &WorkerIdentity,
        script_path: &PathBuf,
    ) -> Arc<WorkerSupervisor> {
        let mut supervisors = self.supervisors.lock().await;
        if let Some(supervisor) = supervisors.get(identity) {
            return supervisor.clone();
        }

        let superseded: Vec<WorkerIdentity> = supervisors
            .keys()
            .filter(|existing| existing.same_worker(identity))
            .cloned()
            .collect();
        for key in superseded {
            if let Some(old) = supervisors.remove(&key) {
                info!("Retiring worker {} in favour of {}", key, identity.worker_hash);
                tokio::spawn(async move { old.shutdown().await });
            }
        }

        let supervisor = Arc::new(WorkerSupervisor::new(
            identity.clone(),
            script_path.clone(),
            self.config.clone(),
            self.launcher.clone(),
        ));
        supervisors.insert(identity.clone(), supervisor.clone());
        supervisor
    }
}

/// Rebase a request onto [`SYSTEM_REQUEST_ORIGIN`], keeping path and query
pub fn internal_request(mut request: SerializableRequest) -> Result<SerializableRequest, ExecutionError> {
    let target = match Url::parse(&request.url) {
        Ok(absolute) => match absolute.query() {
            Some(query) => format!("{}?{}", absolute.path(), query),
            None => absolute.path().to_string(),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => request.url.clone(),
        Err(e) => {
            return Err(ExecutionError::InvalidRequest(format!(
                "{}: {}",
                request.url, e
            )))
        }
    };

    // A leading `//` would otherwise be read as a new host
    let target = format!("/{}", target.trim_start_matches('/'));
    let origin = Url::parse(SYSTEM_REQUEST_ORIGIN)
        .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))?;
    let rebased = origin
        .join(&target)
        .map_err(|e| ExecutionError::InvalidRequest(format!("{}: {}", request.url, e)))?;

    request.url = rebased.to_string();
    Ok(request)
}

fn absolute_path(path: &Path) -> PathBuf {
    match std::path::absolute(path) {
        Ok(absolute) => absolute,
        Err(e) => {
            warn!("Cannot make {} absolute: {}", path.display(), e);
            path.to_path_buf()
        }
    }
}

fn link_cancellation(caller: CancellationToken, execution: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => execution.cancel(),
            _ = execution.cancelled() => {}
        }
    });
}
