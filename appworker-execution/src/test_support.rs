//! In-memory workers for unit tests

use appworker_ipc::{
    MessageSink, MessageSource, PipeMessage, PipeReader, PipeWriter, SerializableRequest,
    WorkerHandshake, WorkerPipeRequest, WorkerStartContext,
};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::context::WorkerIdentity;
use crate::daemon::{DaemonLauncher, PendingDaemon};
use crate::error::ExecutionError;

/// Worker end of an in-memory pipe pair
pub struct FakeWorker {
    pub worker_identifier: String,
    pub token: String,
    pub start: Option<WorkerStartContext>,
    reader: PipeReader<ReadHalf<DuplexStream>>,
    writer: PipeWriter<WriteHalf<DuplexStream>>,
}

impl FakeWorker {
    pub async fn handshake(&mut self) {
        let handshake = WorkerHandshake::new(self.worker_identifier.clone(), self.token.clone());
        self.send_handshake(handshake).await;
    }

    pub async fn send_handshake(&mut self, handshake: WorkerHandshake) {
        self.writer.send_handshake(&handshake).await.unwrap();
    }

    pub async fn send(&mut self, message: PipeMessage) {
        self.writer.send(&message).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.get_mut().write_all(bytes).await.unwrap();
    }

    pub async fn next_message(&mut self) -> Option<PipeMessage> {
        self.reader.receive().await.unwrap()
    }

    pub async fn next_request(&mut self) -> WorkerPipeRequest {
        match self.next_message().await {
            Some(PipeMessage::Request(request)) => request,
            other => panic!("expected a request, got {:?}", other),
        }
    }
}

/// A pending daemon wired to a fake worker
pub fn fake_worker(worker_identifier: &str, token: &str) -> (PendingDaemon, FakeWorker) {
    let identity = WorkerIdentity::new("app", worker_identifier, "hash");
    fake_worker_for(&identity, token, None)
}

fn fake_worker_for(
    identity: &WorkerIdentity,
    token: &str,
    start: Option<WorkerStartContext>,
) -> (PendingDaemon, FakeWorker) {
    let (supervisor_end, worker_end) = tokio::io::duplex(256 * 1024);
    let (supervisor_read, supervisor_write) = tokio::io::split(supervisor_end);
    let (worker_read, worker_write) = tokio::io::split(worker_end);

    let pending = PendingDaemon::attach(identity.clone(), token, supervisor_read, supervisor_write);
    let worker = FakeWorker {
        worker_identifier: identity.worker_identifier.clone(),
        token: token.to_string(),
        start,
        reader: PipeReader::new(worker_read),
        writer: PipeWriter::new(worker_write),
    };
    (pending, worker)
}

/// Launcher handing every new worker to the test
pub struct FakeLauncher {
    workers: mpsc::UnboundedSender<FakeWorker>,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (workers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { workers }), rx)
    }
}

impl DaemonLauncher for FakeLauncher {
    fn launch(
        &self,
        identity: &WorkerIdentity,
        start: &WorkerStartContext,
    ) -> Result<PendingDaemon, ExecutionError> {
        let (pending, worker) = fake_worker_for(identity, &start.worker_token, Some(start.clone()));
        self.workers
            .send(worker)
            .map_err(|_| ExecutionError::Spawn("test dropped the launcher".to_string()))?;
        Ok(pending)
    }
}

/// Launcher that always fails
pub struct FailingLauncher;

impl DaemonLauncher for FailingLauncher {
    fn launch(
        &self,
        _identity: &WorkerIdentity,
        start: &WorkerStartContext,
    ) -> Result<PendingDaemon, ExecutionError> {
        Err(ExecutionError::Spawn(format!(
            "{}: No such file or directory",
            start.script_path.display()
        )))
    }
}

pub fn http_request(id: &str) -> PipeMessage {
    PipeMessage::Request(WorkerPipeRequest::http(id, SerializableRequest::new("GET", "/x")))
}
