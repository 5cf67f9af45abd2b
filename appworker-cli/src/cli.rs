//! CLI argument parsing definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "appworker", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which deployed worker build to run
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// App identifier
    #[arg(long, value_name = "APP")]
    pub app: String,

    /// Worker identifier within the app
    #[arg(long, value_name = "WORKER")]
    pub worker: String,

    /// Deployed build hash of the worker
    #[arg(long, value_name = "HASH")]
    pub hash: String,

    /// Executable inside the build directory (defaults to the configured entrypoint)
    #[arg(long, value_name = "FILE")]
    pub entrypoint: Option<String>,

    /// Do not echo worker output to the terminal
    #[arg(long)]
    pub quiet: bool,

    /// Delete the execution log directory afterwards
    #[arg(long)]
    pub remove_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a system request to a worker's request handler
    RunRequest {
        #[command(flatten)]
        worker: WorkerArgs,

        /// Request path and query, e.g. /hooks/sync?full=1
        #[arg(long, value_name = "PATH")]
        path: String,

        /// HTTP method
        #[arg(long, value_name = "METHOD", default_value = "GET")]
        method: String,

        /// Request body
        #[arg(long, value_name = "BODY")]
        body: Option<String>,

        /// Request header as NAME=VALUE; may be repeated
        #[arg(long = "header", value_name = "NAME=VALUE")]
        headers: Vec<String>,
    },

    /// Run a task on a worker's task handler
    RunTask {
        #[command(flatten)]
        worker: WorkerArgs,

        /// Task identifier
        #[arg(long, value_name = "ID")]
        identifier: String,

        /// JSON task data (example: --data='{"folderId":5}')
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
    },

    /// Print a sample configuration file
    SampleConfig,
}
