//! Docker-backed disposable workspace with hardening defaults.
//!
//! Every [`DockerWorkspace`] is a fresh container: a host scratch directory
//! bound at `/workspace`, a small noexec tmpfs at `/tmp`, no network,
//! capped memory/CPU/pids, `no-new-privileges`, read-only rootfs, all
//! capabilities dropped, and a dedicated non-root user. File operations go
//! through the bound scratch directory; commands run via `docker exec` as
//! plain argv (no shell), wrapped in coreutils `timeout` so the in-container
//! process dies with the deadline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::types::AuditRecord;

use super::{
    append_audit, check_command_allowed, resolve_rel_path, truncate_output, walk_files,
    ExecOutcome, SandboxError, Workspace, WorkspaceFactory,
};

const CONTAINER_USER: &str = "sandbox";
const CONTAINER_WORKDIR: &str = "/workspace";

/// One disposable sandbox container plus its bound host scratch directory.
pub struct DockerWorkspace {
    docker: Docker,
    container_name: String,
    host_dir: PathBuf,
    audit: Mutex<Vec<AuditRecord>>,
    closed: AtomicBool,
}

impl DockerWorkspace {
    /// Create and start a fresh sandbox container.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Infrastructure`] when Docker cannot be
    /// reached or container provisioning fails. This is fatal to the
    /// surrounding stage.
    pub async fn open(docker: Docker, config: &SandboxConfig) -> Result<Self, SandboxError> {
        let container_name = format!("sandbox-{}", uuid::Uuid::new_v4().simple());
        let host_dir = std::env::temp_dir().join(&container_name);
        std::fs::create_dir_all(&host_dir)
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

        let container_config = build_container_config(&host_dir, config)?;
        let options = Some(CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        });

        docker
            .create_container(options, container_config)
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
        docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

        debug!(container = %container_name, "sandbox container started");
        Ok(Self {
            docker,
            container_name,
            host_dir,
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
            &self.host_dir,
            AuditRecord::now(tool, arguments, success, error, duration_ms),
        );
    }

    async fn collect_exec_output(&self, exec_id: &str) -> Result<(Vec<u8>, Vec<u8>), SandboxError> {
        let started = self
            .docker
            .start_exec(
                exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                let log = chunk.map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
                match log {
                    bollard::container::LogOutput::StdOut { message }
                    | bollard::container::LogOutput::Console { message } => {
                        stdout.extend_from_slice(&message);
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.extend_from_slice(&message);
                    }
                    _ => {}
                }
            }
        }

        Ok((stdout, stderr))
    }

    async fn remove_container(docker: &Docker, name: &str) {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = docker.remove_container(name, Some(opts)).await {
            warn!(container = %name, error = %e, "sandbox container removal failed");
        }
    }
}

#[async_trait]
impl Workspace for DockerWorkspace {
    async fn write_file(&self, rel: &str, content: &str) -> Result<(), SandboxError> {
        let args = serde_json::json!({"path": rel, "content_length": content.len()});
        let target = match resolve_rel_path(&self.host_dir, rel) {
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
        let target = match resolve_rel_path(&self.host_dir, rel) {
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
        let target = match resolve_rel_path(&self.host_dir, rel) {
            Ok(path) => path,
            Err(e) => {
                self.audit_op("list_files", args, false, Some(e.to_string()), None);
                return Err(e);
            }
        };
        let mut files = Vec::new();
        let result = walk_files(&self.host_dir, &target, &mut files)
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
        let timeout_secs = deadline.as_secs().max(1);

        // No shell: the in-container process tree is argv wrapped in
        // coreutils timeout, which handles the in-container deadline.
        let mut cmd = vec![
            "timeout".to_owned(),
            "--signal=TERM".to_owned(),
            "--kill-after=5".to_owned(),
            timeout_secs.to_string(),
        ];
        cmd.extend_from_slice(argv);

        let create_exec = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd),
            working_dir: Some(CONTAINER_WORKDIR.to_owned()),
            user: Some(CONTAINER_USER.to_owned()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(&self.container_name, create_exec)
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

        // Grace window past the in-container timeout before we abandon the
        // attachment entirely.
        let wait_window = deadline.saturating_add(Duration::from_secs(10));
        let output_result =
            tokio::time::timeout(wait_window, self.collect_exec_output(&created.id)).await;

        let duration = start.elapsed();
        let (stdout_raw, stderr_raw, timed_out) = match output_result {
            Ok(collected) => {
                let (stdout, stderr) = collected?;
                (stdout, stderr, false)
            }
            Err(_elapsed) => (Vec::new(), Vec::new(), true),
        };

        let exit_code = if timed_out {
            None
        } else {
            let inspect = self
                .docker
                .inspect_exec(&created.id)
                .await
                .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
            inspect.exit_code.and_then(|c| i32::try_from(c).ok())
        };

        // coreutils timeout exits 124 when the deadline fired in-container.
        let timed_out = timed_out || exit_code == Some(124);

        let outcome = ExecOutcome {
            exit_code,
            stdout: truncate_output(&stdout_raw),
            stderr: truncate_output(&stderr_raw),
            timed_out,
            duration,
        };

        let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let error = if outcome.timed_out {
            Some(format!("timeout after {timeout_secs}s"))
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
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        Self::remove_container(&self.docker, &self.container_name).await;
        let _ = std::fs::remove_dir_all(&self.host_dir);
        debug!(container = %self.container_name, "sandbox container destroyed");
    }
}

impl Drop for DockerWorkspace {
    fn drop(&mut self) {
        // A leaked container is a correctness bug: if close() never ran
        // (stage aborted, panic unwind), remove it best-effort from here.
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let docker = self.docker.clone();
        let name = self.container_name.clone();
        let host_dir = self.host_dir.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                Self::remove_container(&docker, &name).await;
                let _ = std::fs::remove_dir_all(&host_dir);
            });
        } else {
            warn!(container = %name, "dropped outside a runtime; container may leak until next sweep");
        }
    }
}

/// Build the hardened container configuration.
fn build_container_config(
    host_dir: &std::path::Path,
    sandbox: &SandboxConfig,
) -> Result<ContainerConfig<String>, SandboxError> {
    let memory_limit = i64::from(sandbox.memory_mb)
        .saturating_mul(1024)
        .saturating_mul(1024);
    let cpu_limit = cpu_cores_to_nano(sandbox.cpu_cores)?;

    let mut tmpfs: HashMap<String, String> = HashMap::new();
    tmpfs.insert("/tmp".to_owned(), "rw,noexec,nosuid,size=100m".to_owned());

    let host_config = HostConfig {
        network_mode: Some("none".to_owned()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
        pids_limit: Some(sandbox.pids_limit),
        memory: Some(memory_limit),
        nano_cpus: Some(cpu_limit),
        binds: Some(vec![format!(
            "{}:{}",
            host_dir.display(),
            CONTAINER_WORKDIR
        )]),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    Ok(ContainerConfig {
        image: Some(sandbox.image.clone()),
        cmd: Some(vec!["sleep".to_owned(), "infinity".to_owned()]),
        user: Some(CONTAINER_USER.to_owned()),
        working_dir: Some(CONTAINER_WORKDIR.to_owned()),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Convert a fractional CPU share to Docker nano-CPUs without lossy float
/// casts: split at the decimal point and scale each side exactly.
fn cpu_cores_to_nano(cpu_cores: f64) -> Result<i64, SandboxError> {
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 {
        return Err(SandboxError::Infrastructure(
            "cpu_cores must be a positive finite number".to_owned(),
        ));
    }

    let rendered = format!("{cpu_cores:.9}");
    let mut parts = rendered.split('.');
    let whole = parts
        .next()
        .unwrap_or("0")
        .parse::<i64>()
        .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
    let mut fraction = parts.next().unwrap_or("0").to_owned();
    fraction.truncate(9);
    while fraction.len() < 9 {
        fraction.push('0');
    }
    let fractional = fraction
        .parse::<i64>()
        .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

    whole
        .checked_mul(1_000_000_000)
        .and_then(|v| v.checked_add(fractional))
        .filter(|v| *v > 0)
        .ok_or_else(|| SandboxError::Infrastructure("cpu_cores out of range".to_owned()))
}

/// Factory producing hardened Docker workspaces.
#[derive(Clone)]
pub struct DockerWorkspaceFactory {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerWorkspaceFactory {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon socket is unreachable.
    pub fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
        Ok(Self { docker, config })
    }

    /// Whether a Docker daemon is reachable.
    pub async fn available() -> bool {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl WorkspaceFactory for DockerWorkspaceFactory {
    async fn open(&self) -> Result<Box<dyn Workspace>, SandboxError> {
        Ok(Box::new(
            DockerWorkspace::open(self.docker.clone(), &self.config).await?,
        ))
    }
}
