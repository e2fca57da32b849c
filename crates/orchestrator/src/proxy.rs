//! Reverse-proxy control
//!
//! The proxy is a shared external process. The orchestrator asks it to test
//! a candidate configuration, to reload or restart, and whether it is healthy.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::health::HttpHealthCheck;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Errors reported by the proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration test failed: {0}")]
    Syntax(String),

    #[error("reload failed: {0}")]
    Reload(String),

    #[error("candidate {0} is outside the proxy configuration directory")]
    OutsideConfigDir(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Operations on the running reverse proxy
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Check that `candidate` (a file inside the config directory) would load
    async fn test_config(&self, candidate: &Path) -> Result<(), ProxyError>;

    /// Graceful reload, keeps established connections
    async fn reload(&self) -> Result<(), ProxyError>;

    async fn restart(&self) -> Result<(), ProxyError>;

    async fn is_healthy(&self) -> bool;

    /// Recent log lines for failure reports; never fails
    async fn tail_logs(&self, lines: usize) -> Vec<String>;
}

/// Name prefix of the temporary wrapper used for syntax checks
const SYNTAX_WRAPPER_PREFIX: &str = ".certpilot-syntax-";

/// nginx running as a service of a [`ContainerRuntime`].
///
/// The host configuration directory is mounted into the container at
/// `container_config_dir`; the main `nginx.conf` includes only
/// `active.conf` from it.
pub struct NginxProxy {
    runtime: Arc<dyn ContainerRuntime>,
    service: String,
    host_config_dir: PathBuf,
    container_config_dir: PathBuf,
    health: Option<HttpHealthCheck>,
}

impl NginxProxy {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        service: impl Into<String>,
        host_config_dir: impl Into<PathBuf>,
        container_config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            service: service.into(),
            host_config_dir: host_config_dir.into(),
            container_config_dir: container_config_dir.into(),
            health: None,
        }
    }

    pub fn with_health_check(mut self, health: HttpHealthCheck) -> Self {
        self.health = Some(health);
        self
    }

    /// Translate a host path inside the config dir to the container's view
    fn container_path(&self, host: &Path) -> Result<PathBuf, ProxyError> {
        let relative = host
            .strip_prefix(&self.host_config_dir)
            .map_err(|_| ProxyError::OutsideConfigDir(host.to_path_buf()))?;
        Ok(self.container_config_dir.join(relative))
    }

    /// Minimal main configuration that includes only the candidate
    fn syntax_wrapper(include: &Path) -> String {
        format!(
            "# generated by certpilot for a syntax check; safe to delete\n\
             events {{}}\n\
             http {{\n    include {};\n}}\n",
            include.display()
        )
    }

    async fn exec(&self, command: &[&str]) -> Result<crate::runtime::CommandOutput, ProxyError> {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        Ok(self.runtime.exec(&self.service, &command).await?)
    }
}

/// Removes the syntax wrapper when dropped
struct WrapperGuard(PathBuf);

impl Drop for WrapperGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "Failed to remove syntax wrapper");
            }
        }
    }
}

#[async_trait]
impl ReverseProxy for NginxProxy {
    async fn test_config(&self, candidate: &Path) -> Result<(), ProxyError> {
        let candidate_in_container = self.container_path(candidate)?;

        let file_name = candidate
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let wrapper = self
            .host_config_dir
            .join(format!("{}{}.check", SYNTAX_WRAPPER_PREFIX, file_name));
        tokio::fs::write(&wrapper, Self::syntax_wrapper(&candidate_in_container)).await?;
        let _guard = WrapperGuard(wrapper.clone());

        let wrapper_in_container = self.container_path(&wrapper)?;
        let wrapper_arg = wrapper_in_container.display().to_string();
        debug!(candidate = %candidate.display(), "Testing nginx configuration");

        let output = self.exec(&["nginx", "-t", "-c", &wrapper_arg]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ProxyError::Syntax(output.tail(5)))
        }
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        info!(service = %self.service, "Reloading nginx");
        let output = self.exec(&["nginx", "-s", "reload"]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ProxyError::Reload(output.tail(5)))
        }
    }

    async fn restart(&self) -> Result<(), ProxyError> {
        info!(service = %self.service, "Restarting nginx");
        self.runtime.restart(&self.service).await?;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        match self.health {
            Some(ref health) => health.check().await,
            None => self.runtime.is_healthy(&self.service).await,
        }
    }

    async fn tail_logs(&self, lines: usize) -> Vec<String> {
        match self.runtime.tail_logs(&self.service, lines).await {
            Ok(lines) => lines,
            Err(e) => vec![format!("(proxy logs unavailable: {})", e)],
        }
    }
}
