//! Disposable isolated workspaces for untrusted generated code.
//!
//! A [`Workspace`] is opened fresh per review, exposes file and command
//! operations under resource caps, records every operation in an
//! append-only audit log, and is destroyed on [`Workspace::close`] or when
//! the handle is dropped on any exit path. Two implementations:
//! [`docker::DockerWorkspace`] for production isolation and
//! [`local::LocalWorkspace`] for tests and no-Docker development.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::AuditRecord;

pub mod docker;
pub mod local;

/// Commands refused at the sandbox boundary, before any process spawns.
pub const BLOCKED_COMMANDS: &[&str] = &[
    "rm", "chmod", "chown", "kill", "pkill", "dd", "mkfs", "mount", "umount",
];

/// Captured output is truncated at this many bytes per stream.
pub const MAX_OUTPUT_BYTES: usize = 50_000;

/// In-workspace audit file name. Kept inside the sandbox for forensic
/// completeness; the host copy survives teardown.
pub const AUDIT_FILE_NAME: &str = ".sandbox_audit.jsonl";

/// Sandbox operation errors.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The relative path escapes the workspace.
    #[error("path-traversal: {0}")]
    PathTraversal(String),
    /// The command's binary is on the deny-list.
    #[error("command '{0}' is blocked")]
    CommandBlocked(String),
    /// The requested file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),
    /// Docker daemon, container, or filesystem failure. Fatal to the
    /// surrounding stage; never retried in-loop.
    #[error("sandbox infrastructure error: {0}")]
    Infrastructure(String),
}

/// Result of a command executed inside a workspace.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecOutcome {
    /// True when the command exited zero within its deadline.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// The most useful error text: stderr, falling back to stdout.
    pub fn failure_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// An isolated, disposable execution workspace.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Write `content` at `rel`, creating parent directories.
    async fn write_file(&self, rel: &str, content: &str) -> Result<(), SandboxError>;

    /// Read the file at `rel`.
    async fn read_file(&self, rel: &str) -> Result<String, SandboxError>;

    /// List files recursively under `rel`, workspace-relative, sorted.
    async fn list_files(&self, rel: &str) -> Result<Vec<String>, SandboxError>;

    /// Run `argv` inside the workspace with a deadline. Timeouts return a
    /// structured [`ExecOutcome`] with `timed_out = true`, never a leaked
    /// process.
    async fn run_command(&self, argv: &[String], deadline: Duration)
        -> Result<ExecOutcome, SandboxError>;

    /// Snapshot of the host-side audit log.
    fn audit_log(&self) -> Vec<AuditRecord>;

    /// Tear the workspace down. Also triggered best-effort on drop.
    async fn close(&self);
}

/// Opens fresh workspaces. The review stage takes this as its seam so
/// tests can substitute the local implementation.
#[async_trait]
pub trait WorkspaceFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Workspace>, SandboxError>;
}

/// Resolve a workspace-relative path lexically, rejecting escapes.
///
/// Leading `/`, empty paths, and `..` components that would climb past the
/// workspace root all fail with [`SandboxError::PathTraversal`]. No
/// filesystem access happens here, so the check also guards paths that do
/// not exist yet.
pub fn resolve_rel_path(root: &Path, rel: &str) -> Result<PathBuf, SandboxError> {
    let trimmed = rel.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::PathTraversal(rel.to_owned()));
    }
    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return Err(SandboxError::PathTraversal(rel.to_owned()));
    }

    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    for component in candidate.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::Normal(part) => parts.push(part.to_owned()),
            std::path::Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SandboxError::PathTraversal(rel.to_owned()));
                }
            }
            _ => return Err(SandboxError::PathTraversal(rel.to_owned())),
        }
    }
    if parts.is_empty() && trimmed != "." {
        return Err(SandboxError::PathTraversal(rel.to_owned()));
    }

    let mut resolved = root.to_path_buf();
    for part in parts {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Check the deny-list against the command's binary name.
pub fn check_command_allowed(argv: &[String]) -> Result<(), SandboxError> {
    let Some(first) = argv.first() else {
        return Err(SandboxError::CommandBlocked("(empty)".to_owned()));
    };
    let binary = Path::new(first)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| first.clone());
    if BLOCKED_COMMANDS.contains(&binary.as_str()) {
        return Err(SandboxError::CommandBlocked(binary));
    }
    Ok(())
}

/// Truncate a byte buffer at [`MAX_OUTPUT_BYTES`] and render it lossily.
pub fn truncate_output(bytes: &[u8]) -> String {
    let slice = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).into_owned()
}

/// Append a record to the host log and, best-effort, to the in-workspace
/// JSONL file. Audit failures never fail the operation itself.
pub(crate) fn append_audit(
    host_log: &Mutex<Vec<AuditRecord>>,
    workspace_root: &Path,
    record: AuditRecord,
) {
    if let Ok(line) = serde_json::to_string(&record) {
        let path = workspace_root.join(AUDIT_FILE_NAME);
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                writeln!(f, "{line}")
            });
    }
    if let Ok(mut log) = host_log.lock() {
        log.push(record);
    }
}

/// Recursively list files under `dir`, returning paths relative to `root`.
/// The audit file and hidden entries are skipped.
pub(crate) fn walk_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            walk_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}
