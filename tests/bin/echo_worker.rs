//! Demo app worker used by the integration tests
//!
//! Requests are dispatched on their path; the body carries the argument.

use anyhow::Result;
use appworker_core::AppTaskError;
use appworker_ipc::{SerializableRequest, TaskPayload};
use appworker_runtime::{HandlerResponse, RequestContext, Thrown, WorkerHandler, WorkerRuntime};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

struct EchoWorker;

fn path_of(url: &str) -> &str {
    let path = url
        .strip_prefix("http://")
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or(url);
    path.split('?').next().unwrap_or(path)
}

fn millis(body: Option<&str>) -> Duration {
    Duration::from_millis(body.and_then(|b| b.trim().parse().ok()).unwrap_or(0))
}

#[async_trait]
impl WorkerHandler for EchoWorker {
    async fn handle_request(
        &self,
        context: RequestContext,
        request: SerializableRequest,
    ) -> Result<HandlerResponse, Thrown> {
        info!("{} {}", request.method, request.url);
        let body = request.body.as_deref();

        match path_of(&request.url) {
            "/echo" => Ok(HandlerResponse::text(200, body.unwrap_or_default())),
            "/whoami" => HandlerResponse::json(
                200,
                &json!({
                    "app": context.app_identifier,
                    "worker": context.worker_identifier,
                    "hash": context.worker_hash,
                    "hasToken": context.auth_token.is_some(),
                    "url": request.url,
                }),
            ),
            "/print" => {
                context.output.print(format!("{}\n", body.unwrap_or("hello")));
                Ok(HandlerResponse::new(204))
            }
            "/stream" => {
                let chunks = (0..3).map(|i| format!("chunk-{}", i).into_bytes());
                Ok(HandlerResponse::stream(200, futures::stream::iter(chunks))
                    .with_header("content-type", "text/plain"))
            }
            "/sleep" => {
                tokio::time::sleep(millis(body)).await;
                Ok(HandlerResponse::text(200, "awake"))
            }
            "/error" => Err(AppTaskError::new("NOT_ALLOWED", "Echo refuses").into()),
            "/invalid" => Err(Thrown::value("plain string")),
            "/exit" => std::process::exit(3),
            other => Ok(HandlerResponse::text(404, format!("no route for {}", other))),
        }
    }

    async fn handle_task(
        &self,
        context: RequestContext,
        task: TaskPayload,
    ) -> Result<Option<HandlerResponse>, Thrown> {
        match task.identifier.as_str() {
            "ok" => {
                context.output.print(format!("task {} done\n", context.execution_id));
                Ok(None)
            }
            "count" => {
                let items = task.data.as_array().map_or(0, Vec::len);
                HandlerResponse::json(200, &json!({ "count": items })).map(Some)
            }
            "retry" => Err(AppTaskError::new("BUSY", "Try again later")
                .with_requeue_delay(Duration::from_secs(30))
                .into()),
            "sleep" => {
                let ms = task.data.get("ms").and_then(|ms| ms.as_u64()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(None)
            }
            _ => Err(Thrown::value(&task.data)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    appworker_logging::init_worker_tracing(None)?;
    WorkerRuntime::from_args()?.run(Arc::new(EchoWorker)).await?;
    Ok(())
}
