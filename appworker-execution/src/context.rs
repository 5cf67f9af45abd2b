//! Execution identity and per-execution context

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Deployed worker a daemon process runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    pub app_identifier: String,
    pub worker_identifier: String,
    pub worker_hash: String,
}

impl WorkerIdentity {
    pub fn new(
        app_identifier: impl Into<String>,
        worker_identifier: impl Into<String>,
        worker_hash: impl Into<String>,
    ) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            worker_identifier: worker_identifier.into(),
            worker_hash: worker_hash.into(),
        }
    }

    /// True for the same app and worker at any hash
    pub fn same_worker(&self, other: &WorkerIdentity) -> bool {
        self.app_identifier == other.app_identifier
            && self.worker_identifier == other.worker_identifier
    }

    /// Directory holding this worker's artifacts under `artifact_root`
    pub fn artifact_dir(&self, artifact_root: &Path) -> PathBuf {
        artifact_root
            .join(path_component(&self.app_identifier))
            .join(path_component(&self.worker_identifier))
            .join(path_component(&self.worker_hash))
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.app_identifier, self.worker_identifier, self.worker_hash
        )
    }
}

/// Everything one execution needs, created before the worker is contacted
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub identity: WorkerIdentity,
    pub script_path: PathBuf,
    pub server_base_url: String,
    /// Token the worker uses to call back into the server for this execution
    pub auth_token: String,
    pub started_at: DateTime<Utc>,
    pub log_dir: PathBuf,
    pub stdout_log_path: PathBuf,
    pub stderr_log_path: PathBuf,
}

impl ExecutionContext {
    pub fn new(
        identity: WorkerIdentity,
        script_path: impl Into<PathBuf>,
        server_base_url: impl Into<String>,
        log_root: &Path,
    ) -> Self {
        let execution_id = Uuid::new_v4();
        let log_dir = log_root
            .join(path_component(&identity.app_identifier))
            .join(path_component(&identity.worker_identifier))
            .join(execution_id.to_string());

        Self {
            execution_id,
            script_path: script_path.into(),
            server_base_url: server_base_url.into(),
            auth_token: generate_token(),
            started_at: Utc::now(),
            stdout_log_path: log_dir.join("stdout.log"),
            stderr_log_path: log_dir.join("stderr.log"),
            log_dir,
            identity,
        }
    }

    /// Execution id as carried on the wire
    pub fn id(&self) -> String {
        self.execution_id.to_string()
    }
}

/// Random bearer token, 64 hex characters
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Map an identifier onto a single safe path component
pub fn path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".repeat(cleaned.len().max(1)),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_component() {
        assert_eq!(path_component("media-app_1.2"), "media-app_1.2");
        assert_eq!(path_component("../etc"), ".._etc");
        assert_eq!(path_component(".."), "__");
        assert_eq!(path_component(""), "_");
        assert_eq!(path_component("a/b c"), "a_b_c");
    }

    #[test]
    fn test_context_paths() {
        let identity = WorkerIdentity::new("media", "thumbnailer", "abc123");
        let context = ExecutionContext::new(
            identity.clone(),
            "/srv/media/thumbnailer/abc123/worker",
            "http://127.0.0.1:3000",
            Path::new("/var/log/appworker"),
        );

        let expected_dir = PathBuf::from("/var/log/appworker/media/thumbnailer")
            .join(context.execution_id.to_string());
        assert_eq!(context.log_dir, expected_dir);
        assert_eq!(context.stdout_log_path, expected_dir.join("stdout.log"));
        assert_eq!(context.stderr_log_path, expected_dir.join("stderr.log"));
        assert_eq!(context.auth_token.len(), 64);
        assert_eq!(context.identity, identity);
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_identity() {
        let current = WorkerIdentity::new("media", "thumbnailer", "abc");
        let next = WorkerIdentity::new("media", "thumbnailer", "def");
        assert!(current.same_worker(&next));
        assert_ne!(current, next);
        assert_eq!(current.to_string(), "media/thumbnailer@abc");
        assert_eq!(
            current.artifact_dir(Path::new("/srv")),
            PathBuf::from("/srv/media/thumbnailer/abc")
        );
    }
}
