//! Process-backed workspace for tests and no-Docker development.
//!
//! Same contract as the Docker workspace -- path policy, deny-list, output
//! truncation, audit log -- but commands run as plain host subprocesses in
//! a temporary directory. Not an isolation boundary; the review pipeline
//! only uses it where the operator has explicitly opted out of Docker.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::types::AuditRecord;

use super::{
    append_audit, check_command_allowed, resolve_rel_path, truncate_output, walk_files,
    ExecOutcome, SandboxError, Workspace, WorkspaceFactory,
};

/// A workspace rooted in a temporary directory on the host.
pub struct LocalWorkspace {
    root: PathBuf,
    // Held for its Drop: removing it deletes the workspace tree.
    _tempdir: tempfile_dir::TempDirHandle,
    audit: Mutex<Vec<AuditRecord>>,
    closed: AtomicBool,
}

/// Minimal owned tempdir so the crate does not depend on `tempfile` outside
/// dev-dependencies: created under the system temp dir, removed on drop.
mod tempfile_dir {
    use std::path::{Path, PathBuf};

    pub struct TempDirHandle {
        path: PathBuf,
    }

    impl TempDirHandle {
        pub fn create(prefix: &str) -> std::io::Result<Self> {
            let path = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&path)?;
            Ok(Self { path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TempDirHandle {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

impl LocalWorkspace {
    /// Create a fresh workspace under the system temp directory.
    pub fn open() -> Result<Self, SandboxError> {
        let tempdir = tempfile_dir::TempDirHandle::create("millwright-ws")
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
        let root = tempdir.path().to_path_buf();
        debug!(root = %root.display(), "local workspace opened");
        Ok(Self {
            root,
            _tempdir: tempdir,
            audit: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn audit_op(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        success: bool,
        error: Option<String>,
        duration_ms: Option<i64>,
    ) {
        append_audit(
            &self.audit,
            &self.root,
            AuditRecord::now(tool, arguments, success, error, duration_ms),
        );
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn write_file(&self, rel: &str, content: &str) -> Result<(), SandboxError> {
        let args = serde_json::json!({"path": rel, "content_length": content.len()});
        let target = match resolve_rel_path(&self.root, rel) {
            Ok(path) => path,
            Err(e) => {
                self.audit_op("file_write", args, false, Some(e.to_string()), None);
                return Err(e);
            }
        };
        let result = async {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| SandboxError::Infrastructure(e.to_string()))
        }
        .await;
        self.audit_op(
            "file_write",
            args,
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
            None,
        );
        result
    }

    async fn read_file(&self, rel: &str) -> Result<String, SandboxError> {
        let args = serde_json::json!({"path": rel});
        let target = match resolve_rel_path(&self.root, rel) {
            Ok(path) => path,
            Err(e) => {
                self.audit_op("file_read", args, false, Some(e.to_string()), None);
                return Err(e);
            }
        };
        let result = match tokio::fs::read_to_string(&target).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::NotFound(rel.to_owned()))
            }
            Err(e) => Err(SandboxError::Infrastructure(e.to_string())),
        };
        self.audit_op(
            "file_read",
            args,
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
            None,
        );
        result
    }

    async fn list_files(&self, rel: &str) -> Result<Vec<String>, SandboxError> {
        let args = serde_json::json!({"path": rel});
        let target = match resolve_rel_path(&self.root, rel) {
            Ok(path) => path,
            Err(e) => {
                self.audit_op("list_files", args, false, Some(e.to_string()), None);
                return Err(e);
            }
        };
        let mut files = Vec::new();
        let result = walk_files(&self.root, &target, &mut files)
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))
            .map(|()| {
                files.sort();
                files
            });
        self.audit_op(
            "list_files",
            args,
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
            None,
        );
        result
    }

    async fn run_command(
        &self,
        argv: &[String],
        deadline: Duration,
    ) -> Result<ExecOutcome, SandboxError> {
        let args = serde_json::json!({"command": argv, "timeout_seconds": deadline.as_secs()});
        if let Err(e) = check_command_allowed(argv) {
            self.audit_op("run_command", args, false, Some(e.to_string()), None);
            return Err(e);
        }

        let start = std::time::Instant::now();
        let spawned = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let outcome = ExecOutcome {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("failed to spawn {}: {e}", argv[0]),
                    timed_out: false,
                    duration: start.elapsed(),
                };
                self.audit_op("run_command", args, false, Some(e.to_string()), None);
                return Ok(outcome);
            }
        };

        // Dropping the wait future on timeout kills the child (kill_on_drop).
        let outcome = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => ExecOutcome {
                exit_code: output.status.code(),
                stdout: truncate_output(&output.stdout),
                stderr: truncate_output(&output.stderr),
                timed_out: false,
                duration: start.elapsed(),
            },
            Ok(Err(e)) => ExecOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
                timed_out: false,
                duration: start.elapsed(),
            },
            Err(_elapsed) => ExecOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                duration: start.elapsed(),
            },
        };

        let duration_ms = i64::try_from(outcome.duration.as_millis()).unwrap_or(i64::MAX);
        let error = if outcome.timed_out {
            Some(format!("timeout after {}s", deadline.as_secs()))
        } else if outcome.success() {
            None
        } else {
            Some(format!("exit code {:?}", outcome.exit_code))
        };
        self.audit_op("run_command", args, outcome.success(), error, Some(duration_ms));
        Ok(outcome)
    }

    fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit.lock().map(|log| log.clone()).unwrap_or_default()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // The tempdir handle removes the tree on drop.
    }
}

/// Factory producing [`LocalWorkspace`] instances.
#[derive(Debug, Clone, Default)]
pub struct LocalWorkspaceFactory;

#[async_trait]
impl WorkspaceFactory for LocalWorkspaceFactory {
    async fn open(&self) -> Result<Box<dyn Workspace>, SandboxError> {
        Ok(Box::new(LocalWorkspace::open()?))
    }
}
