//! Long-lived worker process and the routing of its messages
//!
//! One daemon serves every execution of a [`WorkerIdentity`]. Requests are
//! written by a single writer task; a reader task decodes every line the
//! worker prints and hands it to the execution whose id it carries.

use appworker_ipc::{
    IpcError, MessageSink, MessageSource, PipeMessage, PipeReader, PipeWriter, ProtocolDecodeError,
    Shutdown, WorkerStartContext,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::WorkerIdentity;
use crate::error::{ExecutionError, TimeoutPhase};

/// How long a killed process gets to be reaped
const KILL_WAIT: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A message routed to one execution, or the decode failure that ended the channel
pub type RoutedMessage = Result<PipeMessage, ProtocolDecodeError>;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub killed: bool,
}

/// Starts worker daemons
pub trait DaemonLauncher: Send + Sync {
    fn launch(
        &self,
        identity: &WorkerIdentity,
        start: &WorkerStartContext,
    ) -> Result<PendingDaemon, ExecutionError>;
}

/// Launches the worker executable as a child process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl DaemonLauncher for ProcessLauncher {
    fn launch(
        &self,
        identity: &WorkerIdentity,
        start: &WorkerStartContext,
    ) -> Result<PendingDaemon, ExecutionError> {
        PendingDaemon::spawn(identity.clone(), start)
    }
}

/// A started worker that has not completed its handshake yet
pub struct PendingDaemon {
    identity: WorkerIdentity,
    token: String,
    reader: PipeReader<BoxedReader>,
    writer: PipeWriter<BoxedWriter>,
    child: Option<Child>,
}

impl PendingDaemon {
    /// Spawn the worker executable named by `start.script_path`
    ///
    /// The child gets the start context as its only argument and an empty
    /// environment.
    pub fn spawn(identity: WorkerIdentity, start: &WorkerStartContext) -> Result<Self, ExecutionError> {
        let arg = start
            .to_arg()
            .map_err(|e| ExecutionError::Spawn(format!("Failed to encode start context: {}", e)))?;

        let script_path = std::path::absolute(&start.script_path).map_err(|e| {
            ExecutionError::Spawn(format!("{}: {}", start.script_path.display(), e))
        })?;

        let mut command = Command::new(&script_path);
        command
            .arg(arg)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = script_path.parent() {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            ExecutionError::Spawn(format!("{}: {}", script_path.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Spawn("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Spawn("Failed to get worker stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, identity.to_string()));
        }

        info!("Spawned worker {} (pid {:?})", identity, child.id());

        Ok(Self {
            identity,
            token: start.worker_token.clone(),
            reader: PipeReader::new(Box::new(stdout)),
            writer: PipeWriter::new(Box::new(stdin)),
            child: Some(child),
        })
    }

    /// Wrap a pipe pair that already leads to a worker
    pub fn attach<R, W>(identity: WorkerIdentity, token: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            identity,
            token: token.into(),
            reader: PipeReader::new(Box::new(reader)),
            writer: PipeWriter::new(Box::new(writer)),
            child: None,
        }
    }

    /// Wait for the worker handshake and start routing
    pub async fn await_ready(mut self, timeout: Duration) -> Result<Arc<WorkerDaemon>, ExecutionError> {
        let handshake = match tokio::time::timeout(timeout, self.reader.receive_handshake()).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(IpcError::ConnectionClosed)) => {
                let exit = self.abort().await;
                return Err(ExecutionError::WorkerCrashed {
                    exit_code: exit.and_then(|e| e.code),
                });
            }
            Ok(Err(e)) => {
                self.abort().await;
                return Err(ExecutionError::HandshakeRejected(e.to_string()));
            }
            Err(_) => {
                warn!("Worker {} did not become ready within {:?}", self.identity, timeout);
                let exit = self.abort().await;
                return Err(ExecutionError::TimedOut {
                    phase: TimeoutPhase::AwaitingReady,
                    after: timeout,
                    process_terminated: exit.is_some(),
                });
            }
        };

        if handshake.token != self.token {
            self.abort().await;
            return Err(ExecutionError::HandshakeRejected(
                "worker presented an unknown token".to_string(),
            ));
        }
        if handshake.worker_identifier != self.identity.worker_identifier {
            self.abort().await;
            return Err(ExecutionError::HandshakeRejected(format!(
                "expected worker {} but {} answered",
                self.identity.worker_identifier, handshake.worker_identifier
            )));
        }

        info!("Worker {} ready (pid {})", self.identity, handshake.pid);
        Ok(WorkerDaemon::start(self, handshake.pid))
    }

    /// Kill the process, if any, and report how it ended
    async fn abort(&mut self) -> Option<ProcessExit> {
        let Some(child) = self.child.as_mut() else {
            return Some(ProcessExit {
                code: None,
                killed: true,
            });
        };

        if let Ok(Some(status)) = child.try_wait() {
            return Some(ProcessExit {
                code: status.code(),
                killed: false,
            });
        }
        if let Err(e) = child.start_kill() {
            debug!("Failed to kill worker {}: {}", self.identity, e);
        }
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => Some(ProcessExit {
                code: status.code(),
                killed: true,
            }),
            _ => None,
        }
    }
}

/// A ready worker shared by all executions of its identity
pub struct WorkerDaemon {
    identity: WorkerIdentity,
    pid: u32,
    outbound: mpsc::UnboundedSender<PipeMessage>,
    routes: Arc<RouteTable>,
    stop: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
    has_process: bool,
    /// Why the host stopped this daemon, if it did
    terminated: OnceLock<String>,
}

impl WorkerDaemon {
    fn start(pending: PendingDaemon, pid: u32) -> Arc<Self> {
        let PendingDaemon {
            identity,
            reader,
            writer,
            child,
            ..
        } = pending;

        let label = identity.to_string();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit) = watch::channel(None);
        let routes = Arc::new(RouteTable::default());
        let stop = CancellationToken::new();
        let has_process = child.is_some();

        tokio::spawn(write_loop(writer, outbound_rx, stop.clone(), label.clone()));
        tokio::spawn(read_loop(reader, routes.clone(), stop.clone(), label.clone()));
        if let Some(child) = child {
            tokio::spawn(watch_process(child, stop.clone(), exit_tx, label));
        }

        Arc::new(Self {
            identity,
            pid,
            outbound,
            routes,
            stop,
            exit,
            has_process,
            terminated: OnceLock::new(),
        })
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Pid the worker reported in its handshake
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether new executions can still be routed to this daemon
    pub fn is_alive(&self) -> bool {
        !self.stop.is_cancelled() && !self.routes.is_closed() && self.exit.borrow().is_none()
    }

    /// Number of executions currently waiting on this daemon
    pub fn in_flight(&self) -> usize {
        self.routes.len()
    }

    /// Start receiving the messages of one execution
    pub fn register(&self, execution_id: &str) -> Result<Route, ExecutionError> {
        let receiver = self
            .routes
            .register(execution_id)
            .ok_or_else(|| self.unavailable())?;

        Ok(Route {
            execution_id: execution_id.to_string(),
            routes: self.routes.clone(),
            receiver,
        })
    }

    pub fn send(&self, message: PipeMessage) -> Result<(), ExecutionError> {
        if !self.is_alive() {
            return Err(self.unavailable());
        }
        self.outbound.send(message).map_err(|_| self.unavailable())
    }

    /// Reason given when the host stopped this daemon
    pub fn termination_reason(&self) -> Option<&str> {
        self.terminated.get().map(String::as_str)
    }

    /// Error for an execution that lost this daemon
    pub fn unavailable(&self) -> ExecutionError {
        match self.termination_reason() {
            Some(reason) => ExecutionError::WorkerTerminated {
                reason: reason.to_string(),
            },
            None => ExecutionError::WorkerCrashed {
                exit_code: self.exit_code(),
            },
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.borrow().and_then(|exit| exit.code)
    }

    /// Wait up to `limit` for the process to end
    pub async fn wait_for_exit(&self, limit: Duration) -> Option<ProcessExit> {
        let mut exit = self.exit.clone();
        let status = match tokio::time::timeout(limit, exit.wait_for(Option::is_some)).await {
            Ok(Ok(status)) => *status,
            _ => None,
        };
        status
    }

    /// Terminate the worker now; true once it is known to be gone
    pub async fn kill(&self, reason: &str) -> bool {
        let _ = self.terminated.set(reason.to_string());
        self.stop.cancel();
        self.routes.close(None);

        if !self.has_process {
            return true;
        }
        self.wait_for_exit(KILL_WAIT).await.is_some()
    }

    /// Ask the worker to stop, killing it after `grace`
    pub async fn shutdown(&self, grace: Duration, reason: &str) -> bool {
        let _ = self.terminated.set(reason.to_string());
        if self.is_alive() {
            debug!("Sending shutdown to worker {}: {}", self.identity, reason);
            let _ = self.outbound.send(PipeMessage::Shutdown(Shutdown {
                reason: Some(reason.to_string()),
            }));

            if self.has_process && self.wait_for_exit(grace).await.is_some() {
                self.stop.cancel();
                self.routes.close(None);
                return true;
            }
            if self.has_process {
                debug!("Worker {} ignored shutdown, force killing", self.identity);
            }
        }
        self.kill(reason).await
    }
}

impl Drop for WorkerDaemon {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Receiving end of one execution's messages
///
/// Dropping the route removes it from the daemon.
pub struct Route {
    execution_id: String,
    routes: Arc<RouteTable>,
    receiver: mpsc::UnboundedReceiver<RoutedMessage>,
}

impl Route {
    /// Next message, `None` once the daemon's channel is gone
    pub async fn recv(&mut self) -> Option<RoutedMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        self.routes.remove(&self.execution_id);
    }
}

#[derive(Default)]
struct RouteTable {
    inner: Mutex<RouteState>,
}

#[derive(Default)]
struct RouteState {
    routes: HashMap<String, mpsc::UnboundedSender<RoutedMessage>>,
    closed: bool,
}

impl RouteTable {
    fn lock(&self) -> MutexGuard<'_, RouteState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, execution_id: &str) -> Option<mpsc::UnboundedReceiver<RoutedMessage>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.routes.insert(execution_id.to_string(), tx);
        Some(rx)
    }

    fn remove(&self, execution_id: &str) {
        self.lock().routes.remove(execution_id);
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn len(&self) -> usize {
        self.lock().routes.len()
    }

    fn dispatch(&self, message: PipeMessage, label: &str) {
        let Some(execution_id) = message.correlation_id().map(str::to_owned) else {
            match message {
                PipeMessage::StdoutChunk(chunk) => {
                    info!(worker = label, "{}", chunk.chunk.trim_end());
                }
                PipeMessage::Shutdown(shutdown) => {
                    info!(worker = label, reason = ?shutdown.reason, "Worker announced shutdown");
                }
                other => debug!(worker = label, "Ignoring uncorrelated {} message", other.kind()),
            }
            return;
        };

        let state = self.lock();
        match state.routes.get(&execution_id) {
            Some(route) => {
                let _ = route.send(Ok(message));
            }
            None => debug!(
                worker = label,
                execution_id = %execution_id,
                "Dropping {} for unknown execution",
                message.kind()
            ),
        }
    }

    /// Stop routing; pending executions see `failure`, then end of channel
    fn close(&self, failure: Option<ProtocolDecodeError>) {
        let mut state = self.lock();
        state.closed = true;
        for (_, route) in state.routes.drain() {
            if let Some(error) = &failure {
                let _ = route.send(Err(error.clone()));
            }
        }
    }
}

async fn write_loop<W: MessageSink>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<PipeMessage>,
    stop: CancellationToken,
    label: String,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = stop.cancelled() => break,
        };

        if let Err(e) = writer.send(&message).await {
            match e {
                IpcError::IoError(_) => debug!("Worker {} stdin closed: {}", label, e),
                _ => warn!("Failed to write to worker {}: {}", label, e),
            }
            break;
        }
    }

    let _ = writer.close().await;
}

async fn read_loop<R: MessageSource>(
    mut reader: R,
    routes: Arc<RouteTable>,
    stop: CancellationToken,
    label: String,
) {
    let failure = loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break None,
            next = reader.receive() => next,
        };

        match next {
            Ok(Some(message)) => routes.dispatch(message, &label),
            Ok(None) => {
                debug!("Worker {} closed its output", label);
                break None;
            }
            Err(IpcError::Decode(e)) => {
                warn!("Malformed message from worker {}: {}", label, e);
                stop.cancel();
                break Some(e);
            }
            Err(e) => {
                warn!("Failed to read from worker {}: {}", label, e);
                break None;
            }
        }
    };

    routes.close(failure);
}

async fn watch_process(
    mut child: Child,
    stop: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    label: String,
) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = stop.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill worker {}: {}", label, e);
            }
            (child.wait().await, true)
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit {
            code: status.code(),
            killed,
        },
        Err(e) => {
            warn!("Failed to wait for worker {}: {}", label, e);
            ProcessExit { code: None, killed }
        }
    };

    if killed {
        info!("Worker {} terminated", label);
    } else if exit.code == Some(0) {
        info!("Worker {} exited", label);
    } else {
        warn!("Worker {} exited unexpectedly with code {:?}", label, exit.code);
    }
    let _ = exit_tx.send(Some(exit));
}

/// Log the worker's stderr; it never carries protocol messages
async fn drain_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "appworker::worker", worker = %label, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading stderr of worker {}: {}", label, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_worker, http_request};
    use appworker_ipc::{StdoutChunk, WorkerHandshake, WorkerPipeResponse};

    #[tokio::test]
    async fn test_routes_interleaved_executions() {
        let (pending, mut worker) = fake_worker("thumbnailer", "tok");
        worker.handshake().await;
        let daemon = pending.await_ready(Duration::from_secs(1)).await.unwrap();

        let mut first = daemon.register("exec-1").unwrap();
        let mut second = daemon.register("exec-2").unwrap();
        assert_eq!(daemon.in_flight(), 2);

        daemon.send(http_request("exec-1")).unwrap();
        daemon.send(http_request("exec-2")).unwrap();
        assert_eq!(worker.next_request().await.id, "exec-1");
        assert_eq!(worker.next_request().await.id, "exec-2");

        worker
            .send(PipeMessage::Response(WorkerPipeResponse::empty("exec-2")))
            .await;
        worker
            .send(PipeMessage::StdoutChunk(StdoutChunk {
                request_id: Some("exec-1".to_string()),
                chunk: "hi".to_string(),
            }))
            .await;
        worker
            .send(PipeMessage::Response(WorkerPipeResponse::empty("exec-1")))
            .await;

        assert!(matches!(
            second.recv().await,
            Some(Ok(PipeMessage::Response(r))) if r.id == "exec-2"
        ));
        assert!(matches!(
            first.recv().await,
            Some(Ok(PipeMessage::StdoutChunk(_)))
        ));
        assert!(matches!(
            first.recv().await,
            Some(Ok(PipeMessage::Response(r))) if r.id == "exec-1"
        ));

        drop(first);
        assert_eq!(daemon.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_malformed_line_fails_every_execution() {
        let (pending, mut worker) = fake_worker("thumbnailer", "tok");
        worker.handshake().await;
        let daemon = pending.await_ready(Duration::from_secs(1)).await.unwrap();

        let mut first = daemon.register("exec-1").unwrap();
        let mut second = daemon.register("exec-2").unwrap();
        worker.send_raw(b"Segmentation fault\n").await;

        assert!(matches!(
            first.recv().await,
            Some(Err(ProtocolDecodeError::Malformed(_)))
        ));
        assert!(first.recv().await.is_none());
        assert!(matches!(
            second.recv().await,
            Some(Err(ProtocolDecodeError::Malformed(_)))
        ));
        assert!(!daemon.is_alive());
        assert!(daemon.register("exec-3").is_err());
    }

    #[tokio::test]
    async fn test_eof_ends_routes() {
        let (pending, mut worker) = fake_worker("thumbnailer", "tok");
        worker.handshake().await;
        let daemon = pending.await_ready(Duration::from_secs(1)).await.unwrap();

        let mut route = daemon.register("exec-1").unwrap();
        drop(worker);

        assert!(route.recv().await.is_none());
        assert!(matches!(
            daemon.send(http_request("exec-2")),
            Err(ExecutionError::WorkerCrashed { exit_code: None })
        ));
    }

    #[tokio::test]
    async fn test_killed_daemon_reports_reason() {
        let (pending, mut worker) = fake_worker("thumbnailer", "tok");
        worker.handshake().await;
        let daemon = pending.await_ready(Duration::from_secs(1)).await.unwrap();

        let mut route = daemon.register("exec-1").unwrap();
        assert!(daemon.termination_reason().is_none());
        assert!(daemon.kill("execution exec-2 timed out").await);

        assert!(route.recv().await.is_none());
        assert_eq!(daemon.termination_reason(), Some("execution exec-2 timed out"));
        assert!(matches!(
            daemon.send(http_request("exec-3")),
            Err(ExecutionError::WorkerTerminated { reason }) if reason == "execution exec-2 timed out"
        ));
        assert!(matches!(
            daemon.register("exec-3"),
            Err(ExecutionError::WorkerTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_rejections() {
        let (pending, mut worker) = fake_worker("thumbnailer", "tok");
        worker
            .send_handshake(WorkerHandshake::new("thumbnailer", "forged"))
            .await;
        assert!(matches!(
            pending.await_ready(Duration::from_secs(1)).await,
            Err(ExecutionError::HandshakeRejected(_))
        ));

        let (pending, mut worker) = fake_worker("thumbnailer", "tok");
        worker
            .send_handshake(WorkerHandshake::new("resizer", "tok"))
            .await;
        assert!(matches!(
            pending.await_ready(Duration::from_secs(1)).await,
            Err(ExecutionError::HandshakeRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let (pending, _worker) = fake_worker("thumbnailer", "tok");
        let err = pending
            .await_ready(Duration::from_millis(50))
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            ExecutionError::TimedOut {
                phase: TimeoutPhase::AwaitingReady,
                process_terminated: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_worker() {
        let (pending, mut worker) = fake_worker("thumbnailer", "tok");
        worker.handshake().await;
        let daemon = pending.await_ready(Duration::from_secs(1)).await.unwrap();

        assert!(daemon.shutdown(Duration::from_millis(50), "test").await);
        assert!(!daemon.is_alive());
        assert!(matches!(
            worker.next_message().await,
            Some(PipeMessage::Shutdown(Shutdown { reason: Some(r) })) if r == "test"
        ));
    }
}
