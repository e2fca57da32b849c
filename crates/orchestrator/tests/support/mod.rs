//! In-memory collaborators and a temporary deployment layout for scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use certpilot::{
    Collaborators, CommandOutput, ContainerRuntime, DnsResolver, OneShotTask, Orchestrator,
    ProxyError, PublicIpSource, ReverseProxy, RunConfig, RunOverrides, RuntimeError, Workflow,
};
use certpilot_common::ACTIVE_FILE;
use certpilot_config::{Config, PathsConfig, TimingConfig};

pub const DOMAIN: &str = "example.com";
pub const EMAIL: &str = "ops@example.com";
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);

pub const BOOTSTRAP: &str = "server {\n    listen 80;\n    location /.well-known/acme-challenge/ { root /var/www/certbot; }\n    location / { return 301 https://$host$request_uri; }\n}\n";
pub const FULL: &str = "server {\n    listen 443 ssl;\n    ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem;\n}\n";

/// Marker that makes [`FakeProxy`] reject a candidate configuration
pub const INVALID_MARKER: &str = "INVALID";
/// Marker that makes [`FakeProxy`] report unhealthy while the live file contains it
pub const UNHEALTHY_MARKER: &str = "# unhealthy";

// ----------------------------------------------------------------------------
// Container runtime running a scripted certbot
// ----------------------------------------------------------------------------

pub struct FakeRuntime {
    cert_dir: PathBuf,
    pub tasks: Mutex<Vec<OneShotTask>>,
    pub dry_run_status: AtomicI32,
    pub issue_status: AtomicI32,
    pub renew_status: AtomicI32,
    /// Cancelled when the next task starts, which then never finishes
    pub cancel_during_task: Mutex<Option<CancellationToken>>,
}

impl FakeRuntime {
    fn new(cert_dir: PathBuf) -> Self {
        Self {
            cert_dir,
            tasks: Mutex::new(Vec::new()),
            dry_run_status: AtomicI32::new(0),
            issue_status: AtomicI32::new(0),
            renew_status: AtomicI32::new(0),
            cancel_during_task: Mutex::new(None),
        }
    }

    /// Command lines of every certbot invocation, in order
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.tasks.lock().iter().map(|t| t.command.clone()).collect()
    }

    fn issue(&self, command: &[String]) {
        let domains: Vec<String> = command
            .windows(2)
            .filter(|w| w[0] == "-d")
            .map(|w| w[1].clone())
            .collect();
        write_bundle(&self.cert_dir, &domains[0]);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
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
        Ok(CommandOutput {
            status: Some(0),
            ..Default::default()
        })
    }

    async fn run_one_shot(&self, task: &OneShotTask) -> Result<CommandOutput, RuntimeError> {
        self.tasks.lock().push(task.clone());

        let cancel = self.cancel_during_task.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
            std::future::pending::<()>().await;
        }

        let dry_run = task.command.iter().any(|a| a == "--dry-run");
        let status = match task.command[0].as_str() {
            "certonly" if dry_run => self.dry_run_status.load(Ordering::SeqCst),
            "certonly" => self.issue_status.load(Ordering::SeqCst),
            _ => self.renew_status.load(Ordering::SeqCst),
        };

        if status == 0 && task.command[0] == "certonly" && !dry_run {
            self.issue(&task.command);
        }

        Ok(CommandOutput {
            status: Some(status),
            stdout: String::new(),
            stderr: if status == 0 {
                String::new()
            } else {
                "Certbot failed to authenticate some domains (authenticator: webroot)".to_string()
            },
        })
    }

    async fn is_healthy(&self, _: &str) -> bool {
        true
    }

    async fn tail_logs(&self, _: &str, _: usize) -> Result<Vec<String>, RuntimeError> {
        Ok(Vec::new())
    }
}

/// Self-signed bundle where certbot would write it
pub fn write_bundle(cert_dir: &Path, domain: &str) {
    let live = cert_dir.join("live").join(domain);
    fs::create_dir_all(&live).unwrap();
    let certified = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
    fs::write(live.join("fullchain.pem"), certified.cert.pem()).unwrap();
    fs::write(live.join("privkey.pem"), certified.signing_key.serialize_pem()).unwrap();
}

// ----------------------------------------------------------------------------
// Reverse proxy reading the live file from disk
// ----------------------------------------------------------------------------

pub struct FakeProxy {
    config_dir: PathBuf,
    pub reloads: AtomicU32,
    pub reload_attempts: AtomicU32,
    pub restarts: AtomicU32,
    /// Number of upcoming reloads that fail
    pub failing_reloads: AtomicU32,
}

impl FakeProxy {
    fn new(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            reloads: AtomicU32::new(0),
            reload_attempts: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            failing_reloads: AtomicU32::new(0),
        }
    }

    pub fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseProxy for FakeProxy {
    async fn test_config(&self, candidate: &Path) -> Result<(), ProxyError> {
        let content = fs::read_to_string(candidate)?;
        if content.contains(INVALID_MARKER) {
            return Err(ProxyError::Syntax(format!(
                "nginx: [emerg] unknown directive \"{}\" in {}",
                INVALID_MARKER,
                candidate.display()
            )));
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        self.reload_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_reloads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reloads.store(failing - 1, Ordering::SeqCst);
            return Err(ProxyError::Reload("nginx: [alert] kill(1, 1) failed".to_string()));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<(), ProxyError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        match fs::read_to_string(self.config_dir.join(ACTIVE_FILE)) {
            Ok(live) => !live.contains(UNHEALTHY_MARKER),
            Err(_) => true,
        }
    }

    async fn tail_logs(&self, lines: usize) -> Vec<String> {
        ["nginx: [notice] signal process started", "nginx: [notice] reconfiguring"]
            .iter()
            .take(lines)
            .map(|l| l.to_string())
            .collect()
    }
}

// ----------------------------------------------------------------------------
// DNS and public IP
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeResolver {
    pub records: Mutex<HashMap<String, Ipv4Addr>>,
}

#[async_trait]
impl DnsResolver for FakeResolver {
    async fn resolve_a(&self, domain: &str) -> Result<Option<Ipv4Addr>, String> {
        Ok(self.records.lock().get(domain).copied())
    }
}

pub struct FakePublicIp(pub Mutex<Ipv4Addr>);

#[async_trait]
impl PublicIpSource for FakePublicIp {
    async fn public_ipv4(&self) -> Result<Ipv4Addr, String> {
        Ok(*self.0.lock())
    }
}

// ----------------------------------------------------------------------------
// HTTP server standing in for the proxy's challenge location
// ----------------------------------------------------------------------------

/// Serves files from the challenge directory, or 404 while blocked
struct Webroot {
    root: PathBuf,
    blocked: Arc<AtomicBool>,
    cancel_on_request: Arc<Mutex<Option<CancellationToken>>>,
}

impl Respond for Webroot {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if let Some(cancel) = self.cancel_on_request.lock().take() {
            cancel.cancel();
            return ResponseTemplate::new(404);
        }
        if self.blocked.load(Ordering::SeqCst) {
            return ResponseTemplate::new(404);
        }
        let path = self.root.join(request.url.path().trim_start_matches('/'));
        match fs::read_to_string(path) {
            Ok(body) => ResponseTemplate::new(200).set_body_string(body),
            Err(_) => ResponseTemplate::new(404),
        }
    }
}

// ----------------------------------------------------------------------------
// Test environment
// ----------------------------------------------------------------------------

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub runtime: Arc<FakeRuntime>,
    pub proxy: Arc<FakeProxy>,
    pub resolver: Arc<FakeResolver>,
    pub public_ip: Arc<FakePublicIp>,
    pub challenge_blocked: Arc<AtomicBool>,
    /// Cancelled by the first challenge request, which is answered 404
    pub cancel_on_challenge: Arc<Mutex<Option<CancellationToken>>>,
    server: MockServer,
}

impl TestEnv {
    /// `example.com` resolves to this server, variants are in place,
    /// nothing is live yet
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig {
            config_dir: dir.path().join("nginx/conf.d"),
            challenge_dir: dir.path().join("certbot/www"),
            cert_dir: dir.path().join("certbot/conf"),
        };
        for d in [&paths.config_dir, &paths.challenge_dir, &paths.cert_dir] {
            fs::create_dir_all(d).unwrap();
        }
        fs::write(paths.config_dir.join("bootstrap.conf"), BOOTSTRAP).unwrap();
        fs::write(paths.config_dir.join("full.conf"), FULL).unwrap();

        let mut config = Config {
            domain: Some(DOMAIN.to_string()),
            email: Some(EMAIL.to_string()),
            paths,
            timing: TimingConfig {
                health_deadline_secs: 5,
                health_max_attempts: 3,
                probe_deadline_secs: 5,
                probe_max_attempts: 3,
                initial_delay_ms: 0,
                max_delay_ms: 0,
            },
            ..Default::default()
        };
        config.preflight.public_ip_url = None;

        let challenge_blocked = Arc::new(AtomicBool::new(false));
        let cancel_on_challenge = Arc::new(Mutex::new(None));
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::method("GET"))
            .respond_with(Webroot {
                root: config.paths.challenge_dir.clone(),
                blocked: challenge_blocked.clone(),
                cancel_on_request: cancel_on_challenge.clone(),
            })
            .mount(&server)
            .await;

        let resolver = Arc::new(FakeResolver::default());
        resolver.records.lock().insert(DOMAIN.to_string(), SERVER_IP);

        Self {
            runtime: Arc::new(FakeRuntime::new(config.paths.cert_dir.clone())),
            proxy: Arc::new(FakeProxy::new(config.paths.config_dir.clone())),
            resolver,
            public_ip: Arc::new(FakePublicIp(Mutex::new(SERVER_IP))),
            challenge_blocked,
            cancel_on_challenge,
            config,
            server,
            dir,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let port = self.server.address().port();
        let http = reqwest::Client::builder()
            .resolve(DOMAIN, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .build()
            .unwrap();

        Orchestrator::new(
            self.config.clone(),
            Collaborators {
                runtime: self.runtime.clone(),
                proxy: self.proxy.clone(),
                resolver: self.resolver.clone(),
                public_ip: Some(self.public_ip.clone() as Arc<dyn PublicIpSource>),
                http,
            },
        )
        .with_probe_port(port)
    }

    pub fn run_config(&self, workflow: Workflow) -> RunConfig {
        self.run_config_with(workflow, RunOverrides::default())
    }

    pub fn run_config_with(&self, workflow: Workflow, overrides: RunOverrides) -> RunConfig {
        RunConfig::resolve(&self.config, &overrides, workflow).unwrap()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config.paths.config_dir
    }

    pub fn challenge_dir(&self) -> &Path {
        &self.config.paths.challenge_dir
    }

    pub fn cert_dir(&self) -> &Path {
        &self.config.paths.cert_dir
    }

    pub fn live(&self) -> Option<String> {
        fs::read_to_string(self.config_dir().join(ACTIVE_FILE)).ok()
    }

    pub fn set_live(&self, content: &str) {
        fs::write(self.config_dir().join(ACTIVE_FILE), content).unwrap();
    }

    pub fn set_variant(&self, name: &str, content: &str) {
        fs::write(self.config_dir().join(name), content).unwrap();
    }

    /// Every file under the deployment root with its content
    pub fn snapshot(&self) -> Vec<(PathBuf, Vec<u8>)> {
        let mut out = Vec::new();
        collect_files(self.dir.path(), &mut out);
        out.sort();
        out
    }

    /// Temporary files left in the configuration directory
    pub fn config_temp_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        collect_files(self.config_dir(), &mut out);
        out.into_iter()
            .map(|(p, _)| p)
            .filter(|p| p.extension().is_some_and(|e| e == "tmp"))
            .collect()
    }

    /// Files left under the challenge directory
    pub fn challenge_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        collect_files(self.challenge_dir(), &mut out);
        out.into_iter().map(|(p, _)| p).collect()
    }
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            let content = fs::read(&path).unwrap();
            out.push((path, content));
        }
    }
}
