//! Docker Compose backed runtime.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use certpilot_config::RuntimeConfig;

use super::{CommandOutput, ContainerRuntime, OneShotTask, RuntimeError};

/// Status reported by `docker inspect` for a container without a health check
const RUNNING: &str = "running";
const HEALTHY: &str = "healthy";

const INSPECT_FORMAT: &str =
    "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}";

/// Drives services through `docker compose` and one-shot tasks through `docker run`
#[derive(Debug, Clone)]
pub struct DockerCompose {
    binary: String,
    compose_file: Option<PathBuf>,
    project: Option<String>,
}

impl DockerCompose {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            compose_file: config.compose_file.clone(),
            project: config.project.clone(),
        }
    }

    /// Arguments selecting the compose project, followed by `args`
    pub(crate) fn compose_args(&self, args: &[&str]) -> Vec<String> {
        let mut out = vec!["compose".to_string()];
        if let Some(ref file) = self.compose_file {
            out.push("-f".to_string());
            out.push(file.display().to_string());
        }
        if let Some(ref project) = self.project {
            out.push("-p".to_string());
            out.push(project.clone());
        }
        out.extend(args.iter().map(|a| a.to_string()));
        out
    }

    /// Arguments for `docker run` of a one-shot task
    pub(crate) fn run_args(task: &OneShotTask) -> Vec<String> {
        let mut out = vec!["run".to_string(), "--rm".to_string()];
        for mount in &task.mounts {
            let mut spec = format!("{}:{}", mount.host.display(), mount.container.display());
            if mount.read_only {
                spec.push_str(":ro");
            }
            out.push("-v".to_string());
            out.push(spec);
        }
        for (key, value) in &task.env {
            out.push("-e".to_string());
            out.push(format!("{}={}", key, value));
        }
        out.push(task.image.clone());
        out.extend(task.command.iter().cloned());
        out
    }

    async fn output(&self, args: Vec<String>) -> Result<CommandOutput, RuntimeError> {
        trace!(binary = %self.binary, args = ?args, "Invoking container runtime");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: self.binary.clone(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn checked(&self, args: Vec<String>) -> Result<CommandOutput, RuntimeError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        let output = self.output(args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(RuntimeError::Failed {
                command,
                status: output.status,
                stderr: output.tail(5),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCompose {
    async fn start(&self, service: &str) -> Result<(), RuntimeError> {
        debug!(service = %service, "Starting service");
        self.checked(self.compose_args(&["up", "-d", service])).await?;
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        debug!(service = %service, "Stopping service");
        self.checked(self.compose_args(&["stop", service])).await?;
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<(), RuntimeError> {
        debug!(service = %service, "Restarting service");
        self.checked(self.compose_args(&["restart", service])).await?;
        Ok(())
    }

    async fn exec(&self, service: &str, command: &[String]) -> Result<CommandOutput, RuntimeError> {
        let mut args = self.compose_args(&["exec", "-T", service]);
        args.extend(command.iter().cloned());
        self.output(args).await
    }

    async fn run_one_shot(&self, task: &OneShotTask) -> Result<CommandOutput, RuntimeError> {
        debug!(image = %task.image, command = ?task.command, "Running one-shot task");
        self.output(Self::run_args(task)).await
    }

    async fn is_healthy(&self, service: &str) -> bool {
        let id = match self.checked(self.compose_args(&["ps", "-q", service])).await {
            Ok(output) => output.stdout.trim().to_string(),
            Err(e) => {
                warn!(service = %service, error = %e, "Failed to look up service container");
                return false;
            }
        };
        if id.is_empty() {
            trace!(service = %service, "Service has no running container");
            return false;
        }

        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            INSPECT_FORMAT.to_string(),
            id,
        ];
        match self.checked(args).await {
            Ok(output) => {
                let state = output.stdout.trim();
                trace!(service = %service, state = %state, "Container state");
                state == HEALTHY || state == RUNNING
            }
            Err(e) => {
                warn!(service = %service, error = %e, "Failed to inspect service container");
                false
            }
        }
    }

    async fn tail_logs(&self, service: &str, lines: usize) -> Result<Vec<String>, RuntimeError> {
        let tail = lines.to_string();
        let output = self
            .checked(self.compose_args(&["logs", "--no-color", "--tail", &tail, service]))
            .await?;
        // compose interleaves stdout and stderr of the container on stdout
        Ok(output.stdout.lines().map(|l| l.to_string()).collect())
    }
}
