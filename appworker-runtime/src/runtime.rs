//! Worker main loop
//!
//! The runtime writes the handshake, then reads requests from the pipe and
//! runs each one on its own task. Replies from all tasks are funnelled through
//! one writer task so lines never interleave. A `shutdown` message or EOF on
//! the input stops reading; in-flight handlers are allowed to finish before
//! the runtime returns.

use appworker_core::TaskErrorEnvelope;
use appworker_ipc::{
    stdio_pipes, MessageSink, MessageSource, PipeMessage, PipeReader, PipeWriter, RequestData,
    SerializableResponse, StreamChunk, StreamEnd, WorkerHandshake, WorkerPipeRequest,
    WorkerPipeResponse, WorkerStartContext,
};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::RuntimeError;
use crate::handler::{HandlerResponse, RequestContext, ResponseBody, Thrown, WorkerHandler, WorkerOutput};

type Outbound = mpsc::UnboundedSender<PipeMessage>;

/// Serves a [`WorkerHandler`] over a pipe pair
pub struct WorkerRuntime<R, W> {
    start: WorkerStartContext,
    reader: PipeReader<R>,
    writer: PipeWriter<W>,
}

impl WorkerRuntime<tokio::io::Stdin, tokio::io::Stdout> {
    /// Runtime for a spawned worker: start context from argv[1], stdio pipes
    pub fn from_args() -> Result<Self, RuntimeError> {
        let arg = std::env::args()
            .nth(1)
            .ok_or(RuntimeError::MissingStartContext)?;
        let start = WorkerStartContext::from_arg(&arg)?;
        let (reader, writer) = stdio_pipes();
        Ok(Self::new(start, reader, writer))
    }
}

impl<R, W> WorkerRuntime<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(start: WorkerStartContext, reader: PipeReader<R>, writer: PipeWriter<W>) -> Self {
        Self {
            start,
            reader,
            writer,
        }
    }

    pub fn start_context(&self) -> &WorkerStartContext {
        &self.start
    }

    /// Serve requests until shutdown or EOF
    pub async fn run<H>(self, handler: Arc<H>) -> Result<(), RuntimeError>
    where
        H: WorkerHandler + 'static,
    {
        let Self {
            start,
            mut reader,
            mut writer,
        } = self;
        let start = Arc::new(start);

        writer
            .send_handshake(&WorkerHandshake::new(
                start.worker_identifier.clone(),
                start.worker_token.clone(),
            ))
            .await?;
        info!(
            "Worker {} ({}) ready, pid {}",
            start.worker_identifier,
            start.worker_hash,
            std::process::id()
        );

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        let mut in_flight = JoinSet::new();

        let read_result = loop {
            while in_flight.try_join_next().is_some() {}

            match reader.receive().await {
                Ok(Some(PipeMessage::Request(request))) => {
                    debug!("Received {:?} {}", request.kind, request.id);
                    in_flight.spawn(serve(
                        handler.clone(),
                        start.clone(),
                        request,
                        outbound.clone(),
                    ));
                }
                Ok(Some(PipeMessage::Shutdown(shutdown))) => {
                    info!(
                        "Shutdown requested: {}",
                        shutdown.reason.as_deref().unwrap_or("no reason given")
                    );
                    break Ok(());
                }
                Ok(Some(other)) => {
                    warn!("Ignoring unexpected {} message", other.kind());
                }
                Ok(None) => {
                    info!("Input closed, shutting down");
                    break Ok(());
                }
                Err(appworker_ipc::IpcError::Decode(e)) => {
                    error!("Dropping undecodable message: {}", e);
                }
                Err(e) => break Err(RuntimeError::from(e)),
            };
        };

        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight executions", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Execution task failed: {}", e);
            }
        }

        drop(outbound);
        let mut writer = writer_task
            .await
            .map_err(|e| RuntimeError::Writer(e.to_string()))?;
        if let Err(e) = writer.close().await {
            debug!("Closing output pipe failed: {}", e);
        }

        read_result
    }
}

async fn write_loop<W>(
    mut writer: PipeWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<PipeMessage>,
) -> PipeWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = writer.send(&message).await {
            error!("Failed to write {} message: {}", message.kind(), e);
            break;
        }
    }
    writer
}

async fn serve<H>(
    handler: Arc<H>,
    start: Arc<WorkerStartContext>,
    request: WorkerPipeRequest,
    outbound: Outbound,
) where
    H: WorkerHandler + ?Sized,
{
    let id = request.id.clone();

    if let Some(envelope) = reject(&start, &request) {
        warn!("Rejecting {}: {}", id, envelope.message);
        send(&outbound, PipeMessage::Response(WorkerPipeResponse::failed(id, envelope)));
        return;
    }

    let context = RequestContext {
        execution_id: id.clone(),
        app_identifier: start.app_identifier.clone(),
        worker_identifier: start.worker_identifier.clone(),
        worker_hash: start.worker_hash.clone(),
        auth_token: request.auth_token.clone(),
        server_base_url: start.server_base_url.clone(),
        output: WorkerOutput::new(id.clone(), outbound.clone()),
    };
    let error_log = request.error_log_filepath.clone();

    let failure = match request.data {
        RequestData::Http(http) => {
            let url = http.url.clone();
            match guarded(handler.handle_request(context, http)).await {
                Ok(response) => {
                    send_response(&outbound, &id, url, response).await;
                    None
                }
                Err(thrown) => Some(thrown),
            }
        }
        RequestData::Task(task) => match guarded(handler.handle_task(context, task)).await {
            Ok(Some(result)) => {
                send_response(&outbound, &id, String::new(), result).await;
                None
            }
            Ok(None) => {
                send(&outbound, PipeMessage::Response(WorkerPipeResponse::empty(id.clone())));
                None
            }
            Err(thrown) => Some(thrown),
        },
    };

    if let Some(thrown) = failure {
        let envelope = thrown.into_envelope();
        debug!("Execution {} failed: {}", id, envelope);
        if let Some(path) = error_log {
            append_error_log(&path, &envelope).await;
        }
        send(&outbound, PipeMessage::Response(WorkerPipeResponse::failed(id, envelope)));
    }
}

/// Requests this worker must not run
fn reject(start: &WorkerStartContext, request: &WorkerPipeRequest) -> Option<TaskErrorEnvelope> {
    if !request.is_consistent() {
        return Some(TaskErrorEnvelope::internal(
            "Request kind does not match its payload",
        ));
    }
    match request.app_identifier.as_deref() {
        Some(app) if app != start.app_identifier => Some(TaskErrorEnvelope::internal(format!(
            "Request for app {} sent to a worker of app {}",
            app, start.app_identifier
        ))),
        _ => None,
    }
}

async fn send_response(outbound: &Outbound, id: &str, url: String, response: HandlerResponse) {
    let status_text = response.status_text();
    let HandlerResponse {
        status,
        headers,
        body,
    } = response;
    let mut head = SerializableResponse {
        status,
        status_text,
        headers,
        body: None,
        url,
        is_streaming: None,
    };

    match body {
        ResponseBody::Empty => {
            send(outbound, PipeMessage::Response(WorkerPipeResponse::ok(id, head)));
        }
        ResponseBody::Text(text) => {
            head.body = Some(text);
            send(outbound, PipeMessage::Response(WorkerPipeResponse::ok(id, head)));
        }
        ResponseBody::Stream(mut chunks) => {
            head.is_streaming = Some(true);
            send(outbound, PipeMessage::Response(WorkerPipeResponse::ok(id, head)));

            let mut total_chunks = 0;
            loop {
                match AssertUnwindSafe(chunks.next()).catch_unwind().await {
                    Ok(Some(bytes)) => {
                        send(
                            outbound,
                            PipeMessage::StreamChunk(StreamChunk::encode(id, total_chunks, &bytes)),
                        );
                        total_chunks += 1;
                    }
                    Ok(None) => break,
                    Err(panic) => {
                        // Without stream_end the host treats the body as incomplete
                        error!(
                            "Response stream of {} panicked after {} chunks: {}",
                            id,
                            total_chunks,
                            panic_message(panic.as_ref())
                        );
                        return;
                    }
                }
            }
            send(
                outbound,
                PipeMessage::StreamEnd(StreamEnd {
                    request_id: id.to_string(),
                    total_chunks,
                }),
            );
        }
    }
}

/// Run a handler future, turning a panic into a thrown value
async fn guarded<T>(handler: impl Future<Output = Result<T, Thrown>>) -> Result<T, Thrown> {
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Thrown::value(&json!({
            "panic": panic_message(panic.as_ref()),
        }))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn append_error_log(path: &Path, envelope: &TaskErrorEnvelope) {
    let line = format!(
        "{} {}\n",
        Utc::now().to_rfc3339(),
        serde_json::to_string(envelope).unwrap_or_else(|_| envelope.to_string())
    );
    let written = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = written {
        warn!("Could not append to {}: {}", path.display(), e);
    }
}

fn send(outbound: &Outbound, message: PipeMessage) {
    if outbound.send(message).is_err() {
        warn!("Output pipe closed, dropping reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appworker_core::{AppTaskError, ErrorOrigin, APP_TASK_ERROR, APP_THREW_INVALID_APP_TASK_ERROR, INTERNAL_ERROR};
    use appworker_ipc::{SerializableRequest, Shutdown, TaskPayload};
    use async_trait::async_trait;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    struct EchoHandler;

    #[async_trait]
    impl WorkerHandler for EchoHandler {
        async fn handle_request(
            &self,
            context: RequestContext,
            request: SerializableRequest,
        ) -> Result<HandlerResponse, Thrown> {
            match request.url.as_str() {
                "/stream" => Ok(HandlerResponse::stream(
                    200,
                    futures::stream::iter(vec![b"ab".to_vec(), b"cd".to_vec()]),
                )),
                "/panic" => panic!("boom"),
                _ => {
                    context.output.print("handling");
                    Ok(HandlerResponse::text(200, request.body.unwrap_or_default()))
                }
            }
        }

        async fn handle_task(
            &self,
            _context: RequestContext,
            task: TaskPayload,
        ) -> Result<Option<HandlerResponse>, Thrown> {
            match task.identifier.as_str() {
                "ok" => Ok(None),
                "report" => HandlerResponse::json(200, &task.data).map(Some),
                "quota" => Err(AppTaskError::new("QUOTA", "Over quota")
                    .with_requeue_delay(std::time::Duration::from_secs(1))
                    .into()),
                _ => Err(Thrown::value(&task.data)),
            }
        }
    }

    struct Host {
        reader: PipeReader<ReadHalf<DuplexStream>>,
        writer: PipeWriter<WriteHalf<DuplexStream>>,
        runtime: JoinHandle<Result<(), RuntimeError>>,
    }

    impl Host {
        async fn send(&mut self, message: PipeMessage) {
            self.writer.send(&message).await.unwrap();
        }

        async fn next(&mut self) -> PipeMessage {
            self.reader.receive().await.unwrap().unwrap()
        }

        async fn reply(&mut self) -> WorkerPipeResponse {
            loop {
                match self.next().await {
                    PipeMessage::Response(response) => return response,
                    PipeMessage::StdoutChunk(_) => continue,
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
    }

    fn start_context() -> WorkerStartContext {
        WorkerStartContext {
            worker_identifier: "thumbnailer".to_string(),
            app_identifier: "media".to_string(),
            worker_token: "secret".to_string(),
            server_base_url: "http://127.0.0.1:3000".to_string(),
            script_path: "/artifacts/media/thumbnailer/abc/worker".into(),
            execution_id: "first".to_string(),
            worker_hash: "abc".to_string(),
        }
    }

    async fn start() -> Host {
        let (host_end, worker_end) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_end);
        let (worker_read, worker_write) = tokio::io::split(worker_end);

        let runtime = WorkerRuntime::new(
            start_context(),
            PipeReader::new(worker_read),
            PipeWriter::new(worker_write),
        );
        let runtime = tokio::spawn(runtime.run(Arc::new(EchoHandler)));

        let mut reader = PipeReader::new(host_read);
        let handshake = reader.receive_handshake().await.unwrap();
        assert_eq!(handshake.worker_identifier, "thumbnailer");
        assert_eq!(handshake.token, "secret");

        Host {
            reader,
            writer: PipeWriter::new(host_write),
            runtime,
        }
    }

    fn http(id: &str, url: &str, body: &str) -> PipeMessage {
        PipeMessage::Request(
            WorkerPipeRequest::http(id, SerializableRequest::new("POST", url).with_body(body))
                .with_app_identifier("media"),
        )
    }

    fn task(id: &str, identifier: &str) -> PipeMessage {
        PipeMessage::Request(WorkerPipeRequest::task(
            id,
            TaskPayload::new(identifier, json!({"weird": true})),
        ))
    }

    #[tokio::test]
    async fn test_request_with_stdout() {
        let mut host = start().await;
        host.send(http("e1", "/echo", "hello")).await;

        match host.next().await {
            PipeMessage::StdoutChunk(chunk) => {
                assert_eq!(chunk.request_id.as_deref(), Some("e1"));
                assert_eq!(chunk.chunk, "handling");
            }
            other => panic!("unexpected {:?}", other),
        }
        let reply = host.reply().await;
        assert_eq!(reply.id, "e1");
        let response = reply.response.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.status_text, "OK");
        assert_eq!(response.body.as_deref(), Some("hello"));
        assert_eq!(response.url, "/echo");
    }

    #[tokio::test]
    async fn test_streamed_response() {
        let mut host = start().await;
        host.send(http("e2", "/stream", "")).await;

        let head = host.reply().await;
        assert!(head.is_streaming());
        let mut body = Vec::new();
        loop {
            match host.next().await {
                PipeMessage::StreamChunk(chunk) => body.extend(chunk.decode_bytes().unwrap()),
                PipeMessage::StreamEnd(end) => {
                    assert_eq!(end.total_chunks, 2);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(body, b"abcd");
    }

    #[tokio::test]
    async fn test_task_outcomes() {
        let mut host = start().await;

        host.send(task("t1", "ok")).await;
        let reply = host.reply().await;
        assert!(reply.response.is_none() && reply.error.is_none());

        host.send(task("t1b", "report")).await;
        let response = host.reply().await.response.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some(r#"{"weird":true}"#));
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );

        host.send(task("t2", "quota")).await;
        let error = host.reply().await.error.unwrap();
        assert_eq!(error.code, APP_TASK_ERROR);
        assert_eq!(error.requeue_delay(), Some(std::time::Duration::from_secs(1)));

        host.send(task("t3", "other")).await;
        let error = host.reply().await.error.unwrap();
        assert_eq!(error.code, APP_THREW_INVALID_APP_TASK_ERROR);
        assert_eq!(
            error.cause.details.unwrap().original_error,
            json!({"weird": true})
        );
    }

    #[tokio::test]
    async fn test_panic_is_an_invalid_app_error() {
        let mut host = start().await;
        host.send(http("e3", "/panic", "")).await;

        let error = host.reply().await.error.unwrap();
        assert_eq!(error.code, APP_THREW_INVALID_APP_TASK_ERROR);
        assert_eq!(error.origin(), ErrorOrigin::App);
        assert_eq!(
            error.cause.details.unwrap().original_error,
            json!({"panic": "boom"})
        );

        // The worker keeps serving
        host.send(http("e4", "/echo", "still here")).await;
        assert_eq!(
            host.reply().await.response.unwrap().body.as_deref(),
            Some("still here")
        );
    }

    #[tokio::test]
    async fn test_failure_goes_to_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let stderr_log = dir.path().join("stderr.log");
        let mut host = start().await;

        let request = WorkerPipeRequest::task("t4", TaskPayload::new("quota", json!(null)))
            .with_log_files(dir.path().join("stdout.log"), stderr_log.clone());
        host.send(PipeMessage::Request(request)).await;
        host.reply().await;

        let logged = std::fs::read_to_string(&stderr_log).unwrap();
        assert!(logged.contains("QUOTA"));
        assert!(logged.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_request_for_other_app_is_rejected() {
        let mut host = start().await;
        let request = WorkerPipeRequest::http("e5", SerializableRequest::new("GET", "/"))
            .with_app_identifier("someone-else");
        host.send(PipeMessage::Request(request)).await;

        let error = host.reply().await.error.unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.origin(), ErrorOrigin::Internal);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_runtime() {
        let mut host = start().await;
        host.send(PipeMessage::Shutdown(Shutdown {
            reason: Some("test".to_string()),
        }))
        .await;

        assert!(host.reader.receive().await.unwrap().is_none());
        host.runtime.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_eof_stops_the_runtime() {
        let mut host = start().await;
        host.writer.close().await.unwrap();
        host.runtime.await.unwrap().unwrap();
    }
}
