//! Configuration section types and their defaults.

use certpilot_common::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Paths
// ============================================================================

/// Host-side directories the orchestrator manages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Holds bootstrap.conf, full.conf, active.conf and the backup slot
    pub config_dir: PathBuf,
    /// Webroot shared with the proxy for HTTP-01 challenges
    pub challenge_dir: PathBuf,
    /// Certificate authority client state (contains `live/<domain>/`)
    pub cert_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("./nginx/conf.d"),
            challenge_dir: PathBuf::from("./certbot/www"),
            cert_dir: PathBuf::from("./certbot/conf"),
        }
    }
}

// ============================================================================
// Reverse proxy
// ============================================================================

/// Reverse-proxy process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Service name in the container runtime
    pub service: String,
    /// Where `paths.config_dir` is mounted inside the proxy container
    pub container_config_dir: PathBuf,
    /// HTTP health endpoint; container health state is used when unset
    pub health_url: Option<String>,
    /// Expected health response body (trimmed comparison)
    pub health_body: Option<String>,
    /// Log lines included in failure reports
    pub log_lines: usize,
}

pub(crate) fn default_log_lines() -> usize {
    20
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            service: "nginx".to_string(),
            container_config_dir: PathBuf::from("/etc/nginx/conf.d"),
            health_url: None,
            health_body: None,
            log_lines: default_log_lines(),
        }
    }
}

// ============================================================================
// Container runtime
// ============================================================================

/// Container runtime invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker CLI binary
    pub docker_binary: String,
    /// Compose file; compose defaults apply when unset
    pub compose_file: Option<PathBuf>,
    /// Compose project name
    pub project: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            compose_file: None,
            project: None,
        }
    }
}

// ============================================================================
// Certificate authority client
// ============================================================================

/// Certificate authority client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Image the one-shot client task runs from
    pub image: String,
    /// Use the CA staging environment
    pub staging: bool,
    pub rsa_key_size: u32,
    /// Webroot path as seen by the client container
    pub container_webroot: PathBuf,
    /// `paths.cert_dir` as seen by the client container
    pub container_cert_dir: PathBuf,
    /// Additional names on the certificate (e.g. `www.` alias)
    pub extra_domains: Vec<String>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            image: "certbot/certbot:latest".to_string(),
            staging: false,
            rsa_key_size: 4096,
            container_webroot: PathBuf::from("/var/www/certbot"),
            container_cert_dir: PathBuf::from("/etc/letsencrypt"),
            extra_domains: Vec::new(),
        }
    }
}

// ============================================================================
// Pre-flight
// ============================================================================

/// Pre-flight validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightConfig {
    /// Continue when the domain resolves to an address other than ours
    pub allow_ip_mismatch: bool,
    /// Plain-text service returning the caller's public IPv4 address
    pub public_ip_url: Option<String>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            allow_ip_mismatch: false,
            public_ip_url: Some("https://api.ipify.org".to_string()),
        }
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Polling bounds for health checks and challenge probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub health_deadline_secs: u64,
    pub health_max_attempts: u32,
    pub probe_deadline_secs: u64,
    pub probe_max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            health_deadline_secs: 60,
            health_max_attempts: 30,
            probe_deadline_secs: 60,
            probe_max_attempts: 30,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl TimingConfig {
    /// Backoff used while waiting for the proxy to report healthy
    pub fn health_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.health_max_attempts,
            Duration::from_secs(self.health_deadline_secs),
        )
        .with_delays(self.initial_delay(), self.max_delay())
    }

    /// Backoff used while waiting for the challenge file to be served
    pub fn probe_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.probe_max_attempts,
            Duration::from_secs(self.probe_deadline_secs),
        )
        .with_delays(self.initial_delay(), self.max_delay())
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
