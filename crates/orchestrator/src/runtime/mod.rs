//! Container runtime abstraction
//!
//! The orchestrator never talks to the proxy or the certificate authority
//! client directly; it goes through a [`ContainerRuntime`], which knows how
//! to start, signal and inspect services and how to run one-shot tasks.
//!
//! [`DockerCompose`] is the production implementation. Tests substitute an
//! in-memory fake.

mod compose;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

pub use compose::DockerCompose;

/// Errors invoking the runtime itself (not the workload inside it)
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' failed with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// Bind mount for a one-shot task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// A container that runs a single command and is removed afterwards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OneShotTask {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
}

/// Captured result of a command run inside the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Last `lines` non-empty lines of stderr, falling back to stdout
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let kept: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

/// Operations the orchestrator needs from a container runtime.
///
/// `exec` and `run_one_shot` return the workload's output even when it
/// exits non-zero; only failures of the runtime itself are errors.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, service: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, service: &str) -> Result<(), RuntimeError>;

    async fn restart(&self, service: &str) -> Result<(), RuntimeError>;

    async fn exec(&self, service: &str, command: &[String]) -> Result<CommandOutput, RuntimeError>;

    async fn run_one_shot(&self, task: &OneShotTask) -> Result<CommandOutput, RuntimeError>;

    async fn is_healthy(&self, service: &str) -> bool;

    async fn tail_logs(&self, service: &str, lines: usize) -> Result<Vec<String>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_prefers_stderr() {
        let output = CommandOutput {
            status: Some(1),
            stdout: "stdout line".to_string(),
            stderr: "one\n\ntwo\nthree\n".to_string(),
        };
        assert_eq!(output.tail(2), "two\nthree");
        assert!(!output.success());
    }

    #[test]
    fn test_tail_falls_back_to_stdout() {
        let output = CommandOutput {
            status: Some(0),
            stdout: "a\nb".to_string(),
            stderr: "  \n".to_string(),
        };
        assert_eq!(output.tail(10), "a\nb");
        assert!(output.success());
    }
}
