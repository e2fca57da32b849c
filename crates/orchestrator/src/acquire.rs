//! Certificate acquisition through the certificate authority client
//!
//! certbot runs as a one-shot container in webroot mode. The challenge
//! directory is shared with the proxy, which serves it over HTTP; the
//! certificate directory is where the bundle lands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use certpilot_config::AcmeConfig;

use crate::errors::{AcquisitionPhase, OrchestratorError};
use crate::runtime::{CommandOutput, ContainerRuntime, Mount, OneShotTask};

/// Lines of client output carried in an acquisition error
const DETAIL_LINES: usize = 5;

/// Bind mounts need absolute host paths
fn host_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Parameters of one issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    pub domain: String,
    pub email: String,
    pub extra_domains: Vec<String>,
    pub dry_run: bool,
    /// Re-issue even when a cached certificate is still valid
    pub force_renewal: bool,
    pub staging: bool,
}

impl AcquireRequest {
    fn phase(&self) -> AcquisitionPhase {
        if self.dry_run {
            AcquisitionPhase::DryRun
        } else {
            AcquisitionPhase::Issue
        }
    }
}

/// Drives certbot for issuance and renewal
pub struct CertificateAcquirer {
    runtime: Arc<dyn ContainerRuntime>,
    acme: AcmeConfig,
    challenge_dir: PathBuf,
    cert_dir: PathBuf,
    cancel: CancellationToken,
}

impl CertificateAcquirer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        acme: AcmeConfig,
        challenge_dir: impl Into<PathBuf>,
        cert_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            acme,
            challenge_dir: challenge_dir.into(),
            cert_dir: cert_dir.into(),
            cancel,
        }
    }

    fn webroot(&self) -> String {
        self.acme.container_webroot.display().to_string()
    }

    /// `certonly` arguments for `request`
    pub fn certonly_args(&self, request: &AcquireRequest) -> Vec<String> {
        let mut args = vec![
            "certonly".to_string(),
            "--webroot".to_string(),
            "--webroot-path".to_string(),
            self.webroot(),
            "--email".to_string(),
            request.email.clone(),
            "--agree-tos".to_string(),
            "--no-eff-email".to_string(),
            "--non-interactive".to_string(),
            "--rsa-key-size".to_string(),
            self.acme.rsa_key_size.to_string(),
        ];

        for domain in std::iter::once(&request.domain).chain(request.extra_domains.iter()) {
            args.push("-d".to_string());
            args.push(domain.clone());
        }

        if request.dry_run {
            args.push("--dry-run".to_string());
        }
        if request.force_renewal {
            args.push("--force-renewal".to_string());
        }
        if request.staging {
            args.push("--staging".to_string());
        }
        args
    }

    /// `renew` arguments
    pub fn renew_args(&self, dry_run: bool) -> Vec<String> {
        let mut args = vec![
            "renew".to_string(),
            "--webroot".to_string(),
            "--webroot-path".to_string(),
            self.webroot(),
            "--non-interactive".to_string(),
        ];
        if dry_run {
            args.push("--dry-run".to_string());
        }
        args
    }

    fn task(&self, command: Vec<String>) -> OneShotTask {
        OneShotTask {
            image: self.acme.image.clone(),
            command,
            mounts: vec![
                Mount::new(host_path(&self.cert_dir), &self.acme.container_cert_dir),
                Mount::new(host_path(&self.challenge_dir), &self.acme.container_webroot),
            ],
            env: Vec::new(),
        }
    }

    /// Issue (or dry-run) a certificate for `request.domain`.
    ///
    /// A non-zero client exit is an `Acquisition` error carrying the status;
    /// there is no retry beyond what the client does itself.
    pub async fn acquire(&self, request: &AcquireRequest) -> Result<(), OrchestratorError> {
        let phase = request.phase();
        info!(
            domain = %request.domain,
            dry_run = request.dry_run,
            force_renewal = request.force_renewal,
            staging = request.staging,
            "Requesting certificate"
        );

        let output = self.run(self.task(self.certonly_args(request))).await?;
        self.check(phase, output)?;
        info!(domain = %request.domain, phase = %phase, "Certificate authority client succeeded");
        Ok(())
    }

    /// Renew every certificate the client manages that is near expiry
    pub async fn renew(&self, dry_run: bool) -> Result<(), OrchestratorError> {
        info!(dry_run, "Renewing certificates");
        let output = self.run(self.task(self.renew_args(dry_run))).await?;
        self.check(AcquisitionPhase::Renew, output)?;
        info!("Renewal finished");
        Ok(())
    }

    async fn run(&self, task: OneShotTask) -> Result<CommandOutput, OrchestratorError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            result = self.runtime.run_one_shot(&task) => Ok(result?),
        }
    }

    fn check(&self, phase: AcquisitionPhase, output: CommandOutput) -> Result<(), OrchestratorError> {
        if output.success() {
            return Ok(());
        }
        let detail = output.tail(DETAIL_LINES);
        warn!(phase = %phase, status = ?output.status, "Certificate authority client failed");
        Err(OrchestratorError::Acquisition {
            phase,
            status: output.status,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedRuntime {
        status: Option<i32>,
        tasks: Mutex<Vec<OneShotTask>>,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn start(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn stop(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn restart(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn exec(&self, _: &str, _: &[String]) -> Result<CommandOutput, RuntimeError> {
            Ok(CommandOutput::default())
        }
        async fn run_one_shot(&self, task: &OneShotTask) -> Result<CommandOutput, RuntimeError> {
            self.tasks.lock().push(task.clone());
            Ok(CommandOutput {
                status: self.status,
                stdout: String::new(),
                stderr: "Saving debug log\nChallenge failed for domain example.com\n".to_string(),
            })
        }
        async fn is_healthy(&self, _: &str) -> bool {
            true
        }
        async fn tail_logs(&self, _: &str, _: usize) -> Result<Vec<String>, RuntimeError> {
            Ok(Vec::new())
        }
    }

    fn acquirer(status: Option<i32>) -> (Arc<ScriptedRuntime>, CertificateAcquirer) {
        let runtime = Arc::new(ScriptedRuntime {
            status,
            tasks: Mutex::new(Vec::new()),
        });
        let acquirer = CertificateAcquirer::new(
            runtime.clone(),
            AcmeConfig::default(),
            "/srv/certbot/www",
            "/srv/certbot/conf",
            CancellationToken::new(),
        );
        (runtime, acquirer)
    }

    fn request() -> AcquireRequest {
        AcquireRequest {
            domain: "example.com".to_string(),
            email: "ops@example.com".to_string(),
            extra_domains: vec!["www.example.com".to_string()],
            dry_run: true,
            force_renewal: false,
            staging: false,
        }
    }

    #[test]
    fn test_certonly_args() {
        let (_, acquirer) = acquirer(Some(0));
        let mut req = request();
        req.dry_run = false;
        req.force_renewal = true;

        assert_eq!(
            acquirer.certonly_args(&req),
            vec![
                "certonly",
                "--webroot",
                "--webroot-path",
                "/var/www/certbot",
                "--email",
                "ops@example.com",
                "--agree-tos",
                "--no-eff-email",
                "--non-interactive",
                "--rsa-key-size",
                "4096",
                "-d",
                "example.com",
                "-d",
                "www.example.com",
                "--force-renewal",
            ]
        );
    }

    #[test]
    fn test_renew_args() {
        let (_, acquirer) = acquirer(Some(0));
        assert_eq!(
            acquirer.renew_args(true),
            vec!["renew", "--webroot", "--webroot-path", "/var/www/certbot", "--non-interactive", "--dry-run"]
        );
    }

    #[tokio::test]
    async fn test_dry_run_mounts_shared_dirs() {
        let (runtime, acquirer) = acquirer(Some(0));
        acquirer.acquire(&request()).await.unwrap();

        let tasks = runtime.tasks.lock();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].image, "certbot/certbot:latest");
        assert!(tasks[0].command.contains(&"--dry-run".to_string()));
        assert_eq!(
            tasks[0].mounts,
            vec![
                Mount::new("/srv/certbot/conf", "/etc/letsencrypt"),
                Mount::new("/srv/certbot/www", "/var/www/certbot"),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_carries_status_and_phase() {
        let (_, acquirer) = acquirer(Some(1));
        let err = acquirer.acquire(&request()).await.unwrap_err();

        match err {
            OrchestratorError::Acquisition { phase, status, ref detail } => {
                assert_eq!(phase, AcquisitionPhase::DryRun);
                assert_eq!(status, Some(1));
                assert!(detail.contains("Challenge failed"));
            }
            other => panic!("expected acquisition error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_renew_failure() {
        let (_, acquirer) = acquirer(Some(1));
        let err = acquirer.renew(false).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Acquisition {
                phase: AcquisitionPhase::Renew,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_client_runs() {
        let (_, acquirer) = acquirer(Some(0));
        acquirer.cancel.cancel();
        let err = acquirer.acquire(&request()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}
