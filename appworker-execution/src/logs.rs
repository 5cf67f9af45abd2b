//! Per-execution log files

use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;

use crate::context::ExecutionContext;

/// Stdout log of one execution
///
/// The stderr log is created empty here; the worker appends its own error
/// records to it.
pub struct ExecutionLogs {
    dir: PathBuf,
    stdout: BufWriter<File>,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl ExecutionLogs {
    pub async fn create(context: &ExecutionContext) -> std::io::Result<Self> {
        fs::create_dir_all(&context.log_dir).await?;
        let stdout = File::create(&context.stdout_log_path).await?;
        File::create(&context.stderr_log_path).await?;

        Ok(Self {
            dir: context.log_dir.clone(),
            stdout: BufWriter::new(stdout),
            stdout_path: context.stdout_log_path.clone(),
            stderr_path: context.stderr_log_path.clone(),
        })
    }

    pub async fn append_stdout(&mut self, chunk: &str) -> std::io::Result<()> {
        self.stdout.write_all(chunk.as_bytes()).await
    }

    /// Flush buffered output to disk
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.stdout.flush().await?;
        self.stdout.get_ref().sync_all().await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }
}

/// Remove an execution's log directory, logging instead of failing
pub async fn remove_log_dir(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove worker log directory {}: {}", dir.display(), e),
    }
}
