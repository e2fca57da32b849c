//! Orchestrator error taxonomy.
//!
//! Every failure maps to a [`FailureKind`], which decides the process exit
//! code and which canned remediation [`Hint`] the failure report shows.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use certpilot_config::ConfigError;

use crate::runtime::RuntimeError;

/// Which certificate authority client invocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionPhase {
    DryRun,
    Issue,
    Renew,
}

impl fmt::Display for AcquisitionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionPhase::DryRun => "dry-run issuance",
            AcquisitionPhase::Issue => "certificate issuance",
            AcquisitionPhase::Renew => "certificate renewal",
        })
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "no exit status (terminated by signal)".to_string(),
    }
}

fn describe_holder(holder: &Option<String>) -> String {
    holder
        .as_deref()
        .map(|h| format!(" ({})", h))
        .unwrap_or_default()
}

/// Errors raised by orchestrator stages
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("domain '{domain}' does not resolve to an IPv4 address ({detail})")]
    DomainUnresolved { domain: String, detail: String },

    #[error("domain '{domain}' resolves to {resolved} but this server's public IP is {public} (pass --allow-ip-mismatch to continue anyway)")]
    DomainIpMismatch {
        domain: String,
        resolved: Ipv4Addr,
        public: Ipv4Addr,
    },

    #[error("challenge file not served at {url} after {attempts} attempt(s), last result: {last}; likely causes: DNS not yet propagated, firewall blocking port 80, or another process bound to port 80")]
    ChallengeUnreachable {
        domain: String,
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("{phase} failed with {}: {detail}", describe_status(.status))]
    Acquisition {
        phase: AcquisitionPhase,
        status: Option<i32>,
        detail: String,
    },

    #[error("proxy not healthy after {context}: gave up after {attempts} attempt(s) in {elapsed:?}")]
    ProxyUnhealthy {
        context: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("refusing to activate {path}: {reason}")]
    ConfigWrite { path: PathBuf, reason: String },

    #[error("another run holds the lock {path}{}", describe_holder(.holder))]
    LockContention {
        path: PathBuf,
        holder: Option<String>,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OrchestratorError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            OrchestratorError::DomainUnresolved { .. } => FailureKind::Dns,
            OrchestratorError::DomainIpMismatch { .. } => FailureKind::IpMismatch,
            OrchestratorError::ChallengeUnreachable { .. } => FailureKind::Challenge,
            OrchestratorError::Acquisition { .. } => FailureKind::Acquisition,
            OrchestratorError::ProxyUnhealthy { .. } => FailureKind::ProxyHealth,
            OrchestratorError::ConfigWrite { .. } => FailureKind::ConfigWrite,
            OrchestratorError::LockContention { .. } => FailureKind::Lock,
            OrchestratorError::Cancelled => FailureKind::Cancelled,
            OrchestratorError::Config(_) => FailureKind::Config,
            OrchestratorError::Runtime(_) | OrchestratorError::Io { .. } => FailureKind::Other,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn hint(&self) -> Option<Hint> {
        self.kind().hint()
    }
}

/// Failure classes with distinct exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Dns,
    IpMismatch,
    Challenge,
    Acquisition,
    ProxyHealth,
    ConfigWrite,
    Lock,
    Cancelled,
    Config,
    Other,
}

impl FailureKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureKind::Other => 1,
            FailureKind::Config => 2,
            FailureKind::Dns => 10,
            FailureKind::IpMismatch => 11,
            FailureKind::Challenge => 20,
            FailureKind::Acquisition => 30,
            FailureKind::ProxyHealth => 40,
            FailureKind::ConfigWrite => 41,
            FailureKind::Lock => 50,
            FailureKind::Cancelled => 60,
        }
    }

    pub fn hint(&self) -> Option<Hint> {
        match self {
            FailureKind::Dns => Some(Hint::DnsPropagation),
            FailureKind::Challenge | FailureKind::Acquisition => Some(Hint::FirewallPorts),
            FailureKind::IpMismatch => Some(Hint::DomainIpMismatch),
            _ => None,
        }
    }
}

/// Canned remediation advice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    DnsPropagation,
    FirewallPorts,
    DomainIpMismatch,
}

impl Hint {
    pub fn text(&self) -> &'static str {
        match self {
            Hint::DnsPropagation => {
                "DNS changes can take up to 48 hours to propagate. Check the A record with \
                 `dig +short <domain> A` from another network and retry once it returns this \
                 server's address."
            }
            Hint::FirewallPorts => {
                "The certificate authority must reach this server on port 80. Check that DNS \
                 has propagated, that the firewall / security group allows inbound 80 and 443, \
                 and that no other process is bound to port 80 (`ss -ltnp 'sport = :80'`)."
            }
            Hint::DomainIpMismatch => {
                "The domain points at a different address than this server. Update the A \
                 record to this server's public IP, or rerun with --allow-ip-mismatch if the \
                 server sits behind a NAT or load balancer that forwards port 80."
            }
        }
    }
}
