//! Per-run parameters

use std::fmt;

use certpilot_common::RunId;
use certpilot_config::{Config, ConfigError, ConfigResult, ValidationResult};
use certpilot_config::validate::{validate_domain, validate_email};

/// The workflows the orchestrator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    /// Pre-flight DNS check only
    Validate,
    /// Challenge reachability against the live proxy
    Probe,
    /// First issuance: bootstrap, dry run, issue, switch to TLS
    Setup,
    /// Forced re-issue over a broken or stale certificate
    Fix,
    /// Periodic renewal and reload
    Renew,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Validate => "validate",
            Workflow::Probe => "probe",
            Workflow::Setup => "setup",
            Workflow::Fix => "fix",
            Workflow::Renew => "renew",
        }
    }

    /// Issuance workflows need a contact email
    pub fn needs_email(&self) -> bool {
        matches!(self, Workflow::Setup | Workflow::Fix)
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command-line values that take precedence over the configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub domain: Option<String>,
    pub email: Option<String>,
    pub allow_ip_mismatch: bool,
    pub force_renewal: bool,
    pub staging: bool,
    pub dry_run: bool,
}

/// Immutable parameters of one run, handed to every stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub run_id: RunId,
    pub workflow: Workflow,
    pub domain: String,
    /// Present for issuance workflows
    pub email: Option<String>,
    pub extra_domains: Vec<String>,
    pub allow_ip_mismatch: bool,
    pub force_renewal: bool,
    pub staging: bool,
    /// `renew --dry-run`
    pub dry_run: bool,
}

impl RunConfig {
    /// Resolve run parameters from the loaded configuration and overrides.
    ///
    /// Flags only ever switch boolean settings on.
    pub fn resolve(config: &Config, overrides: &RunOverrides, workflow: Workflow) -> ConfigResult<Self> {
        let domain = match overrides.domain {
            Some(ref domain) => domain.clone(),
            None => config.require_domain()?.to_string(),
        }
        .trim()
        .to_ascii_lowercase();

        let mut result = ValidationResult::new();
        result.merge(validate_domain(&domain));
        for extra in &config.acme.extra_domains {
            result.merge(validate_domain(extra));
        }

        let email = if workflow.needs_email() {
            let email = match overrides.email {
                Some(ref email) => email.clone(),
                None => config.require_email()?.to_string(),
            };
            result.merge(validate_email(&email));
            Some(email)
        } else {
            overrides.email.clone().or_else(|| config.email.clone())
        };

        if !result.is_ok() {
            return Err(ConfigError::Invalid(result));
        }

        Ok(Self {
            run_id: RunId::new(),
            workflow,
            domain,
            email,
            extra_domains: config.acme.extra_domains.clone(),
            allow_ip_mismatch: overrides.allow_ip_mismatch || config.preflight.allow_ip_mismatch,
            // fix always re-issues
            force_renewal: overrides.force_renewal || workflow == Workflow::Fix,
            staging: overrides.staging || config.acme.staging,
            dry_run: overrides.dry_run && workflow == Workflow::Renew,
        })
    }
}
