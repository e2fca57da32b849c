//! Run orchestration
//!
//! Each workflow is a straight line of stages. A stage either completes or
//! ends the run; what is left behind on failure depends on the stage:
//!
//! | Stage           | On failure                                                 |
//! |-----------------|------------------------------------------------------------|
//! | validate-dns    | nothing touched                                            |
//! | bootstrap       | left as is (bootstrap is always safe)                      |
//! | probe-challenge | stays on bootstrap                                         |
//! | dry-run         | pre-run configuration restored                             |
//! | acquire, verify | stays on bootstrap so HTTP keeps serving                   |
//! | finalize        | full stays active; an unhealthy proxy makes the run degraded |
//! | renew, reload   | configuration untouched                                    |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use certpilot_common::{ConfigVariant, RunId, BACKUP_FILE};
use certpilot_config::{inspect_bundle, BundleInfo, Config};

use crate::acquire::{AcquireRequest, CertificateAcquirer};
use crate::errors::{AcquisitionPhase, OrchestratorError};
use crate::health::HttpHealthCheck;
use crate::lock::RunLock;
use crate::poll::sleep_or_cancel;
use crate::preflight::{
    DnsResolver, HttpPublicIp, PreflightReport, PreflightValidator, PublicIpSource, SystemResolver,
};
use crate::probe::{ChallengeProber, ProbeReport};
use crate::proxy::{NginxProxy, ReverseProxy};
use crate::run::{RunConfig, Workflow};
use crate::runtime::{ContainerRuntime, DockerCompose};
use crate::toggle::{detect_active, wait_healthy, ConfigToggler};

/// Reload attempts after a successful renewal
pub const RENEW_RELOAD_ATTEMPTS: u32 = 3;

/// Stages of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Init,
    ValidateDns,
    Lock,
    Bootstrap,
    ProbeChallenge,
    DryRun,
    Acquire,
    Verify,
    Finalize,
    Renew,
    Reload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ValidateDns => "validate-dns",
            Stage::Lock => "lock",
            Stage::Bootstrap => "bootstrap",
            Stage::ProbeChallenge => "probe-challenge",
            Stage::DryRun => "dry-run",
            Stage::Acquire => "acquire",
            Stage::Verify => "verify",
            Stage::Finalize => "finalize",
            Stage::Renew => "renew",
            Stage::Reload => "reload",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a run
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded,
    /// The certificate is in place and `full` is active, but the proxy did
    /// not report healthy
    Degraded(OrchestratorError),
    Failed {
        stage: Stage,
        error: OrchestratorError,
    },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Degraded(_) => "degraded",
            RunOutcome::Failed { .. } => "failed",
        }
    }
}

/// Everything a run observed, for the caller to print
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: Workflow,
    pub domain: String,
    /// Stages that completed, in order
    pub completed: Vec<Stage>,
    pub outcome: RunOutcome,
    pub preflight: Option<PreflightReport>,
    pub probe: Option<ProbeReport>,
    pub bundle_before: Option<BundleInfo>,
    pub bundle: Option<BundleInfo>,
    /// Things worth telling the operator that are not errors
    pub notes: Vec<String>,
    /// Tail of the proxy logs; collected only when the run did not succeed
    pub proxy_logs: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded)
    }

    pub fn error(&self) -> Option<&OrchestratorError> {
        match self.outcome {
            RunOutcome::Succeeded => None,
            RunOutcome::Degraded(ref error) => Some(error),
            RunOutcome::Failed { ref error, .. } => Some(error),
        }
    }

    /// Stage the run ended in, if it did not succeed
    pub fn stage_reached(&self) -> Option<Stage> {
        match self.outcome {
            RunOutcome::Succeeded => None,
            RunOutcome::Degraded(_) => Some(Stage::Finalize),
            RunOutcome::Failed { stage, .. } => Some(stage),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Succeeded => 0,
            RunOutcome::Degraded(ref error) => error.exit_code(),
            RunOutcome::Failed { ref error, .. } => error.exit_code(),
        }
    }
}

/// Output of the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub domain: Option<String>,
    pub config_dir: PathBuf,
    pub active: String,
    pub backup_present: bool,
    pub certificate: Option<BundleInfo>,
    pub days_remaining: Option<i64>,
    pub expired: Option<bool>,
    pub certificate_error: Option<String>,
}

/// The external systems a run talks to
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub resolver: Arc<dyn DnsResolver>,
    pub public_ip: Option<Arc<dyn PublicIpSource>>,
    pub http: reqwest::Client,
}

impl Collaborators {
    /// Docker Compose, nginx, the system resolver and an HTTP public IP echo
    pub fn production(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("certpilot/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCompose::new(&config.runtime));

        let mut proxy = NginxProxy::new(
            runtime.clone(),
            config.proxy.service.clone(),
            config.paths.config_dir.clone(),
            config.proxy.container_config_dir.clone(),
        );
        if let Some(ref url) = config.proxy.health_url {
            proxy = proxy.with_health_check(HttpHealthCheck::new(
                http.clone(),
                url.clone(),
                config.proxy.health_body.clone(),
            ));
        }

        let public_ip = config
            .preflight
            .public_ip_url
            .as_ref()
            .map(|url| Arc::new(HttpPublicIp::new(http.clone(), url.clone())) as Arc<dyn PublicIpSource>);

        Ok(Self {
            runtime,
            proxy: Arc::new(proxy),
            resolver: Arc::new(SystemResolver),
            public_ip,
            http,
        })
    }
}

/// Stage bookkeeping for one run
struct Progress {
    current: Stage,
    completed: Vec<Stage>,
    preflight: Option<PreflightReport>,
    probe: Option<ProbeReport>,
    bundle_before: Option<BundleInfo>,
    bundle: Option<BundleInfo>,
    notes: Vec<String>,
}

impl Progress {
    fn new() -> Self {
        Self {
            current: Stage::Init,
            completed: vec![],
            preflight: None,
            probe: None,
            bundle_before: None,
            bundle: None,
            notes: vec![],
        }
    }

    /// Move to `stage` unless the run was cancelled
    fn enter(&mut self, stage: Stage, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        self.completed.push(self.current);
        self.current = stage;
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        info!(stage = %stage, "Entering stage");
        Ok(())
    }

    fn finish(&mut self) {
        self.completed.push(self.current);
    }
}

/// Certificate lifecycle orchestrator
pub struct Orchestrator {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn ReverseProxy>,
    resolver: Arc<dyn DnsResolver>,
    public_ip: Option<Arc<dyn PublicIpSource>>,
    http: reqwest::Client,
    cancel: CancellationToken,
    probe_port: Option<u16>,
}

impl Orchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config,
            runtime: collaborators.runtime,
            proxy: collaborators.proxy,
            resolver: collaborators.resolver,
            public_ip: collaborators.public_ip,
            http: collaborators.http,
            cancel: CancellationToken::new(),
            probe_port: None,
        }
    }

    /// Probe the challenge path on a port other than 80
    pub fn with_probe_port(mut self, port: u16) -> Self {
        self.probe_port = Some(port);
        self
    }

    /// Token that cancels the current and any later run
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `run.workflow` to a terminal state
    pub async fn run(&self, run: &RunConfig) -> RunReport {
        let span = info_span!(
            "run",
            run_id = %run.run_id.short(),
            workflow = %run.workflow,
            domain = %run.domain
        );
        self.execute(run).instrument(span).await
    }

    async fn execute(&self, run: &RunConfig) -> RunReport {
        let started = Instant::now();
        let mut progress = Progress::new();
        info!("Run started");

        let result = match run.workflow {
            Workflow::Validate => self.validate_flow(run, &mut progress).await,
            Workflow::Probe => self.probe_flow(run, &mut progress).await,
            Workflow::Setup => self.setup_flow(run, &mut progress).await,
            Workflow::Fix => self.fix_flow(run, &mut progress).await,
            Workflow::Renew => self.renew_flow(run, &mut progress).await,
        };

        let outcome = match result {
            Ok(()) => {
                progress.finish();
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Run succeeded");
                RunOutcome::Succeeded
            }
            Err(error @ OrchestratorError::ProxyUnhealthy { .. }) if progress.current == Stage::Finalize => {
                warn!(error = %error, "Certificate installed but proxy unhealthy; not reverting to bootstrap");
                RunOutcome::Degraded(error)
            }
            Err(error) => {
                error!(stage = %progress.current, error = %error, "Run failed");
                RunOutcome::Failed {
                    stage: progress.current,
                    error,
                }
            }
        };

        let proxy_logs = match outcome {
            RunOutcome::Succeeded => Vec::new(),
            _ => self.proxy.tail_logs(self.config.proxy.log_lines).await,
        };

        RunReport {
            run_id: run.run_id.clone(),
            workflow: run.workflow,
            domain: run.domain.clone(),
            completed: progress
                .completed
                .into_iter()
                .filter(|s| *s != Stage::Init)
                .collect(),
            outcome,
            preflight: progress.preflight,
            probe: progress.probe,
            bundle_before: progress.bundle_before,
            bundle: progress.bundle,
            notes: progress.notes,
            proxy_logs,
            elapsed: started.elapsed(),
        }
    }

    fn toggler(&self, run: &RunConfig) -> ConfigToggler {
        ConfigToggler::new(
            &self.config.paths.config_dir,
            &self.config.paths.cert_dir,
            &run.domain,
            self.proxy.clone(),
            self.config.timing.health_policy(),
            self.cancel.clone(),
        )
    }

    fn prober(&self) -> ChallengeProber {
        ChallengeProber::new(
            self.http.clone(),
            &self.config.paths.challenge_dir,
            self.config.timing.probe_policy(),
            self.cancel.clone(),
        )
        .with_port(self.probe_port)
    }

    fn acquirer(&self) -> CertificateAcquirer {
        CertificateAcquirer::new(
            self.runtime.clone(),
            self.config.acme.clone(),
            &self.config.paths.challenge_dir,
            &self.config.paths.cert_dir,
            self.cancel.clone(),
        )
    }

    fn validator(&self, run: &RunConfig) -> PreflightValidator {
        let mut validator =
            PreflightValidator::new(self.resolver.clone()).allow_ip_mismatch(run.allow_ip_mismatch);
        if let Some(ref source) = self.public_ip {
            validator = validator.with_public_ip(source.clone());
        }
        validator
    }

    fn request(&self, run: &RunConfig, dry_run: bool, force_renewal: bool) -> Result<AcquireRequest, OrchestratorError> {
        let email = run
            .email
            .clone()
            .ok_or(OrchestratorError::Config(certpilot_config::ConfigError::Missing("email")))?;
        Ok(AcquireRequest {
            domain: run.domain.clone(),
            email,
            extra_domains: run.extra_domains.clone(),
            dry_run,
            force_renewal,
            staging: run.staging,
        })
    }

    fn lock(&self) -> Result<RunLock, OrchestratorError> {
        let lock = RunLock::acquire(&self.config.paths.config_dir)?;
        info!(lock = %lock.path().display(), "Holding run lock");
        Ok(lock)
    }

    async fn validate_dns(&self, run: &RunConfig, progress: &mut Progress) -> Result<(), OrchestratorError> {
        progress.enter(Stage::ValidateDns, &self.cancel)?;
        let report = self.validator(run).validate(&run.domain).await?;
        progress.notes.extend(report.warnings.iter().cloned());
        progress.preflight = Some(report);
        Ok(())
    }

    async fn probe_challenge(&self, run: &RunConfig, progress: &mut Progress) -> Result<(), OrchestratorError> {
        progress.enter(Stage::ProbeChallenge, &self.cancel)?;
        progress.probe = Some(self.prober().probe(&run.domain).await?);
        Ok(())
    }

    async fn validate_flow(&self, run: &RunConfig, progress: &mut Progress) -> Result<(), OrchestratorError> {
        self.validate_dns(run, progress).await
    }

    async fn probe_flow(&self, run: &RunConfig, progress: &mut Progress) -> Result<(), OrchestratorError> {
        progress.enter(Stage::Lock, &self.cancel)?;
        let _lock = self.lock()?;
        self.probe_challenge(run, progress).await
    }

    async fn setup_flow(&self, run: &RunConfig, progress: &mut Progress) -> Result<(), OrchestratorError> {
        self.validate_dns(run, progress).await?;

        progress.enter(Stage::Lock, &self.cancel)?;
        let _lock = self.lock()?;
        let mut toggler = self.toggler(run);
        let acquirer = self.acquirer();

        progress.enter(Stage::Bootstrap, &self.cancel)?;
        toggler.activate(ConfigVariant::Bootstrap).await?;

        self.probe_challenge(run, progress).await?;

        progress.enter(Stage::DryRun, &self.cancel)?;
        if let Err(e) = acquirer.acquire(&self.request(run, true, false)?).await {
            if matches!(e, OrchestratorError::Cancelled) {
                progress
                    .notes
                    .push("cancelled during dry run; bootstrap left active".to_string());
            } else {
                self.roll_back(&mut toggler, progress).await;
            }
            return Err(e);
        }

        progress.enter(Stage::Acquire, &self.cancel)?;
        acquirer
            .acquire(&self.request(run, false, run.force_renewal)?)
            .await?;

        self.verify_and_finalize(run, &mut toggler, progress).await
    }

    async fn fix_flow(&self, run: &RunConfig, progress: &mut Progress) -> Result<(), OrchestratorError> {
        progress.enter(Stage::Lock, &self.cancel)?;
        let _lock = self.lock()?;
        let mut toggler = self.toggler(run);

        progress.enter(Stage::Bootstrap, &self.cancel)?;
        toggler.activate(ConfigVariant::Bootstrap).await?;

        self.probe_challenge(run, progress).await?;

        progress.enter(Stage::Acquire, &self.cancel)?;
        self.acquirer().acquire(&self.request(run, false, true)?).await?;

        self.verify_and_finalize(run, &mut toggler, progress).await
    }

    async fn verify_and_finalize(
        &self,
        run: &RunConfig,
        toggler: &mut ConfigToggler,
        progress: &mut Progress,
    ) -> Result<(), OrchestratorError> {
        progress.enter(Stage::Verify, &self.cancel)?;
        progress.bundle = Some(self.verify_bundle(&run.domain)?);

        progress.enter(Stage::Finalize, &self.cancel)?;
        toggler.activate(ConfigVariant::Full).await
    }

    async fn renew_flow(&self, run: &RunConfig, progress: &mut Progress) -> Result<(), OrchestratorError> {
        progress.enter(Stage::Lock, &self.cancel)?;
        let _lock = self.lock()?;

        let before = self.inspect_for_report(&run.domain, progress);
        progress.bundle_before = before;
        if let Some(ref before) = progress.bundle_before {
            info!(
                not_after = %before.not_after,
                days_remaining = before.days_remaining(Utc::now()),
                "Certificate before renewal"
            );
        }

        progress.enter(Stage::Renew, &self.cancel)?;
        self.acquirer().renew(run.dry_run).await?;

        if run.dry_run {
            progress.notes.push("dry run: proxy not reloaded".to_string());
            return Ok(());
        }

        progress.enter(Stage::Reload, &self.cancel)?;
        self.reload_with_retry().await?;

        let after = self.inspect_for_report(&run.domain, progress);
        progress.bundle = after;
        if let Some(ref after) = progress.bundle {
            info!(
                not_after = %after.not_after,
                days_remaining = after.days_remaining(Utc::now()),
                "Certificate after renewal"
            );
        }
        Ok(())
    }

    /// Put the pre-run configuration back after a failed dry run.
    ///
    /// A failed rollback is noted but does not replace the dry-run error.
    async fn roll_back(&self, toggler: &mut ConfigToggler, progress: &mut Progress) {
        match toggler.restore().await {
            Ok(true) => progress
                .notes
                .push("pre-run proxy configuration restored".to_string()),
            Ok(false) => progress
                .notes
                .push("no configuration was active before this run; bootstrap left active".to_string()),
            Err(e) => {
                warn!(error = %e, "Rollback failed");
                progress.notes.push(format!("rollback failed: {}", e));
            }
        }
    }

    /// The client claimed success; make sure a usable bundle is on disk
    fn verify_bundle(&self, domain: &str) -> Result<BundleInfo, OrchestratorError> {
        let missing = |detail: String| OrchestratorError::Acquisition {
            phase: AcquisitionPhase::Issue,
            status: Some(0),
            detail,
        };

        match inspect_bundle(&self.config.paths.cert_dir, domain) {
            Ok(Some(info)) if info.is_expired(Utc::now()) => Err(missing(format!(
                "certificate for {} expired at {}",
                domain, info.not_after
            ))),
            Ok(Some(info)) => {
                info!(
                    subject = %info.subject,
                    not_after = %info.not_after,
                    "Certificate bundle verified"
                );
                Ok(info)
            }
            Ok(None) => Err(missing(format!(
                "client reported success but no bundle exists under {}",
                self.config.paths.cert_dir.join("live").join(domain).display()
            ))),
            Err(e) => Err(missing(e.message)),
        }
    }

    fn inspect_for_report(&self, domain: &str, progress: &mut Progress) -> Option<BundleInfo> {
        match inspect_bundle(&self.config.paths.cert_dir, domain) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Could not inspect certificate bundle");
                progress.notes.push(format!("could not inspect certificate: {}", e.message));
                None
            }
        }
    }

    /// Reload (never restart) after renewal, retrying a bounded number of times
    async fn reload_with_retry(&self) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let policy = self.config.timing.health_policy();
        let mut delay = policy.initial_delay;
        let mut last = String::new();

        for attempt in 1..=RENEW_RELOAD_ATTEMPTS {
            match self.proxy.reload().await {
                Ok(()) => {
                    match wait_healthy(self.proxy.as_ref(), &policy, &self.cancel, "reload after renewal").await {
                        Ok(_) => {
                            info!(attempt, "Proxy reloaded with renewed certificates");
                            return Ok(());
                        }
                        Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                        Err(e) => last = e.to_string(),
                    }
                }
                Err(e) => last = e.to_string(),
            }
            warn!(attempt, error = %last, "Reload after renewal failed");

            if attempt < RENEW_RELOAD_ATTEMPTS {
                if !sleep_or_cancel(delay, &self.cancel).await {
                    return Err(OrchestratorError::Cancelled);
                }
                delay = (delay * 2).min(policy.max_delay);
            }
        }

        Err(OrchestratorError::ProxyUnhealthy {
            context: format!("reload after renewal (last error: {})", last),
            attempts: RENEW_RELOAD_ATTEMPTS,
            elapsed: started.elapsed(),
        })
    }

    /// Read-only snapshot of the configuration directory and certificate
    pub fn status(&self, domain: Option<&str>) -> Result<StatusReport, OrchestratorError> {
        let config_dir = &self.config.paths.config_dir;
        let active = detect_active(config_dir)?;
        let backup_present = config_dir.join(BACKUP_FILE).is_file();

        let now = Utc::now();
        let (certificate, certificate_error) = match domain {
            Some(domain) => match inspect_bundle(&self.config.paths.cert_dir, domain) {
                Ok(info) => (info, None),
                Err(e) => (None, Some(e.message)),
            },
            None => (None, None),
        };

        Ok(StatusReport {
            domain: domain.map(str::to_string),
            config_dir: config_dir.clone(),
            active: active.to_string(),
            backup_present,
            days_remaining: certificate.as_ref().map(|c| c.days_remaining(now)),
            expired: certificate.as_ref().map(|c| c.is_expired(now)),
            certificate,
            certificate_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::ValidateDns.to_string(), "validate-dns");
        assert_eq!(Stage::ProbeChallenge.to_string(), "probe-challenge");
        assert_eq!(
            serde_json::to_string(&Stage::DryRun).unwrap(),
            "\"dry-run\""
        );
    }

    #[test]
    fn test_progress_tracks_completed_stages() {
        let cancel = CancellationToken::new();
        let mut progress = Progress::new();
        progress.enter(Stage::Lock, &cancel).unwrap();
        progress.enter(Stage::Bootstrap, &cancel).unwrap();

        cancel.cancel();
        let err = progress.enter(Stage::ProbeChallenge, &cancel).unwrap_err();

        assert!(matches!(err, OrchestratorError::Cancelled));
        assert_eq!(progress.current, Stage::ProbeChallenge);
        assert_eq!(progress.completed, vec![Stage::Init, Stage::Lock, Stage::Bootstrap]);
    }

    #[test]
    fn test_degraded_exit_code() {
        let report = RunReport {
            run_id: RunId::from_string("00000000-0000-0000-0000-000000000000"),
            workflow: Workflow::Setup,
            domain: "example.com".to_string(),
            completed: vec![],
            outcome: RunOutcome::Degraded(OrchestratorError::ProxyUnhealthy {
                context: "activating full".to_string(),
                attempts: 30,
                elapsed: Duration::from_secs(60),
            }),
            preflight: None,
            probe: None,
            bundle_before: None,
            bundle: None,
            notes: vec![],
            proxy_logs: vec![],
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.exit_code(), 40);
        assert_eq!(report.stage_reached(), Some(Stage::Finalize));
        assert!(!report.is_success());
    }
}
