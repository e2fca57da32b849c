//! Certpilot Orchestrator Library
//!
//! Certificate lifecycle orchestration for a reverse proxy that gets its TLS
//! certificates from Let's Encrypt through a webroot challenge.
//!
//! The orchestrator composes four capabilities:
//!
//! - **Pre-flight**: DNS resolution and public IP comparison
//! - **Toggling**: atomic swaps of the proxy between `bootstrap` and `full`
//!   configurations, with a single-slot backup and restore
//! - **Acquisition**: certbot dry run, issuance and renewal as one-shot tasks
//! - **Verification**: bounded health polling and rollback
//!
//! # Example
//!
//! ```ignore
//! use certpilot::{Collaborators, Orchestrator, RunConfig, RunOverrides, Workflow};
//! use certpilot_config::Config;
//!
//! let config = Config::load(None)?;
//! let run = RunConfig::resolve(&config, &RunOverrides::default(), Workflow::Setup)?;
//! let orchestrator = Orchestrator::new(config.clone(), Collaborators::production(&config)?);
//! let report = orchestrator.run(&run).await;
//! std::process::exit(report.exit_code());
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acquire;
pub mod errors;
pub mod health;
pub mod lock;
pub mod orchestrator;
pub mod poll;
pub mod preflight;
pub mod probe;
pub mod proxy;
pub mod run;
pub mod runtime;
pub mod signals;
pub mod toggle;
pub mod triage;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use errors::{AcquisitionPhase, FailureKind, Hint, OrchestratorError};

// Orchestration
pub use orchestrator::{
    Collaborators, Orchestrator, RunOutcome, RunReport, Stage, StatusReport,
    RENEW_RELOAD_ATTEMPTS,
};
pub use run::{RunConfig, RunOverrides, Workflow};

// Stages
pub use acquire::{AcquireRequest, CertificateAcquirer};
pub use lock::RunLock;
pub use preflight::{
    DnsResolver, HttpPublicIp, PreflightReport, PreflightValidator, PublicIpSource, SystemResolver,
};
pub use probe::{ChallengeProber, ProbeFile, ProbeReport};
pub use toggle::{checksum, detect_active, BackupSlot, ConfigToggler};

// External processes
pub use health::HttpHealthCheck;
pub use proxy::{NginxProxy, ProxyError, ReverseProxy};
pub use runtime::{CommandOutput, ContainerRuntime, DockerCompose, Mount, OneShotTask, RuntimeError};
