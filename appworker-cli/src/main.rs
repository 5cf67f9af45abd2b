use anyhow::{bail, Context, Result};
use appworker_config::{AppWorkerConfig, ConfigLoader, LogLevel};
use appworker_execution::{
    ExecutionOptions, InvocationOptions, StaticExecConfigLookup, StdoutLine, SystemRequestExecutor,
    SystemRequestParams, TaskOutcome, TaskParams, WorkerExecConfig,
};
use appworker_ipc::{SerializableRequest, TaskPayload};
use clap::Parser;
use serde_json::{from_str, json, to_string_pretty, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;
use cli::{Cli, Commands, WorkerArgs};

/// Load configuration, letting --log-level win over the file and environment
fn load_config(cli: &Cli) -> Result<AppWorkerConfig> {
    let mut config = ConfigLoader::new()
        .load(cli.config.as_ref())
        .context("Failed to load configuration")?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(config)
}

/// Parse input JSON or use empty object if none provided
fn parse_input_json(input_json: Option<&String>) -> Result<JsonValue> {
    match input_json {
        Some(json_str) => from_str(json_str).context("Failed to parse task data JSON"),
        None => Ok(json!({})),
    }
}

fn parse_header(header: &str) -> Result<(String, String)> {
    match header.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => bail!("Invalid header '{}', expected NAME=VALUE", header),
    }
}

fn build_executor(config: &AppWorkerConfig, worker: &WorkerArgs) -> SystemRequestExecutor {
    let mut exec_config = WorkerExecConfig::with_hash(&worker.hash);
    if let Some(entrypoint) = &worker.entrypoint {
        exec_config = exec_config.with_entrypoint(entrypoint);
    }
    let lookup = StaticExecConfigLookup::new();
    lookup.insert(&worker.app, &worker.worker, exec_config);

    SystemRequestExecutor::new(config.execution.clone(), Arc::new(lookup))
}

/// Options that echo worker output and cancel on Ctrl-C
fn invocation_options(worker: &WorkerArgs) -> InvocationOptions {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution");
            on_signal.cancel();
        }
    });

    let mut invocation = InvocationOptions::new(ExecutionOptions {
        print_worker_output: false,
        remove_worker_directory: worker.remove_logs,
    })
    .with_cancel(cancel);

    if !worker.quiet {
        let (sink, mut lines) = mpsc::unbounded_channel::<StdoutLine>();
        tokio::spawn(async move {
            // stdout is reserved for the JSON result
            while let Some(line) = lines.recv().await {
                eprint!("{}", line.chunk);
            }
        });
        invocation = invocation.with_stdout_sink(Arc::new(sink));
    }
    invocation
}

async fn run_request(
    config: &AppWorkerConfig,
    worker: &WorkerArgs,
    request: SerializableRequest,
) -> Result<JsonValue> {
    let executor = build_executor(config, worker);
    let params = SystemRequestParams {
        app_identifier: worker.app.clone(),
        worker_identifier: worker.worker.clone(),
        request,
    };

    let result = executor
        .run_system_request(params, invocation_options(worker))
        .await;
    executor.shutdown_all().await;

    let result = result.context("System request failed")?;
    Ok(json!({ "result": result }))
}

async fn run_task(config: &AppWorkerConfig, worker: &WorkerArgs, task: TaskPayload) -> Result<JsonValue> {
    let executor = build_executor(config, worker);
    let params = TaskParams {
        app_identifier: worker.app.clone(),
        worker_identifier: worker.worker.clone(),
        task,
    };

    let outcome = executor.run_task(params, invocation_options(worker)).await;
    executor.shutdown_all().await;

    Ok(match outcome.context("Task failed")? {
        TaskOutcome::Completed(result) => json!({ "status": "completed", "result": result }),
        TaskOutcome::AppError(error) => json!({
            "status": "app_error",
            "requeueDelayMs": error.cause.requeue_delay_ms,
            "error": error,
        }),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        print!("{}", AppWorkerConfig::generate_sample());
        return Ok(());
    }

    let config = load_config(&cli)?;
    config.validate_all().context("Invalid configuration")?;
    appworker_logging::init_logging_from_config(&config.logging)?;
    debug!("Configuration: {:?}", config);

    let output = match &cli.command {
        Commands::RunRequest {
            worker,
            path,
            method,
            body,
            headers,
        } => {
            info!("Running {} {} on {}/{}", method, path, worker.app, worker.worker);
            let mut request = SerializableRequest::new(method.to_ascii_uppercase(), path);
            for header in headers {
                let (name, value) = parse_header(header)?;
                request = request.with_header(name, value);
            }
            if let Some(body) = body {
                request = request.with_body(body);
            }
            run_request(&config, worker, request).await?
        }
        Commands::RunTask {
            worker,
            identifier,
            data,
        } => {
            info!("Running task {} on {}/{}", identifier, worker.app, worker.worker);
            let data = parse_input_json(data.as_ref())?;
            run_task(&config, worker, TaskPayload::new(identifier, data)).await?
        }
        Commands::SampleConfig => return Ok(()),
    };

    let formatted = to_string_pretty(&output).context("Failed to format result as JSON")?;
    println!("{}", formatted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("x-token=a=b").unwrap(),
            ("x-token".to_string(), "a=b".to_string())
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn test_parse_input_json() {
        assert_eq!(parse_input_json(None).unwrap(), json!({}));
        let data = r#"{"folderId":5}"#.to_string();
        assert_eq!(parse_input_json(Some(&data)).unwrap(), json!({"folderId": 5}));
        assert!(parse_input_json(Some(&"{".to_string())).is_err());
    }

    #[test]
    fn test_cli_parses_run_request() {
        let cli = Cli::try_parse_from([
            "appworker",
            "--log-level",
            "debug",
            "run-request",
            "--app",
            "media",
            "--worker",
            "thumbnailer",
            "--hash",
            "abc",
            "--path",
            "/thumbs",
            "--header",
            "a=1",
            "--header",
            "b=2",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::RunRequest {
                worker,
                method,
                headers,
                ..
            } => {
                assert_eq!(worker.hash, "abc");
                assert_eq!(method, "GET");
                assert_eq!(headers, vec!["a=1", "b=2"]);
            }
            _ => panic!("expected run-request"),
        }
    }
}
