//! Version-control publishing seam.
//!
//! The publisher stage hands reviewed artifacts to a [`VcsPublisher`]:
//! stage files, commit, push a branch, and optionally open a merge
//! request. [`GitCliPublisher`] drives the `git` binary in the run's
//! working tree; tests substitute an in-memory implementation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Publishing errors. A publisher failure moves the run to `failed` but
/// never undoes the review outcome.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("git {command} failed: {detail}")]
    Command { command: String, detail: String },
    #[error("{0}")]
    Io(String),
}

/// The consumed version-control interface.
#[async_trait]
pub trait VcsPublisher: Send + Sync {
    async fn add_files(&self, paths: &[PathBuf]) -> Result<(), VcsError>;

    async fn commit(&self, message: &str) -> Result<(), VcsError>;

    async fn push_to(&self, branch: &str) -> Result<(), VcsError>;

    /// Open (or fast-forward) a merge request. Returns `None` when the
    /// backing forge is not configured for MR creation.
    async fn open_merge_request(
        &self,
        title: &str,
        body: &str,
        branch: &str,
    ) -> Result<Option<String>, VcsError>;
}

/// Sanitize arbitrary text into a usable branch name.
pub fn sanitize_branch_name(raw: &str) -> String {
    let mut cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.truncate(80);
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "agent-patch".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Publisher shelling out to the `git` CLI.
pub struct GitCliPublisher {
    work_dir: PathBuf,
    remote: String,
}

impl GitCliPublisher {
    pub fn new(work_dir: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            remote: remote.into(),
        }
    }

    async fn git(&self, args: &[&str], deadline: Duration) -> Result<String, VcsError> {
        if !self.work_dir.join(".git").exists() {
            return Err(VcsError::NotARepo(self.work_dir.display().to_string()));
        }
        let child = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.work_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VcsError::Io(e.to_string()))?;

        let output = tokio::time::timeout(deadline, child.wait_with_output())
            .await
            .map_err(|_| VcsError::Command {
                command: args.join(" "),
                detail: "timed out".to_owned(),
            })?
            .map_err(|e| VcsError::Io(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::Command {
                command: args.join(" "),
                detail: stderr.chars().take(500).collect(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VcsPublisher for GitCliPublisher {
    async fn add_files(&self, paths: &[PathBuf]) -> Result<(), VcsError> {
        for path in paths {
            let rendered = path.display().to_string();
            // -f: generated output directories are commonly gitignored.
            self.git(&["add", "-f", &rendered], Duration::from_secs(10))
                .await?;
        }
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<(), VcsError> {
        self.git(&["commit", "-m", message], Duration::from_secs(10))
            .await?;
        Ok(())
    }

    async fn push_to(&self, branch: &str) -> Result<(), VcsError> {
        let refspec = format!("HEAD:{branch}");
        self.git(&["push", &self.remote, &refspec], Duration::from_secs(60))
            .await?;
        Ok(())
    }

    async fn open_merge_request(
        &self,
        _title: &str,
        _body: &str,
        _branch: &str,
    ) -> Result<Option<String>, VcsError> {
        // The plain git publisher pushes the branch; MR creation belongs to
        // a forge-specific adapter layered on top.
        Ok(None)
    }
}
