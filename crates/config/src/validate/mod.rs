//! Configuration validation
//!
//! Validation collects every problem instead of stopping at the first one so
//! an operator can fix a configuration file in a single pass. Errors block a
//! run; warnings are printed and the run continues.

#[cfg(feature = "validation")]
pub mod certs;
pub mod lint;

use serde::Serialize;
use std::fmt;

use crate::Config;

/// Broad category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCategory {
    Domain,
    Email,
    Path,
    Timing,
    Certificate,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Domain => "domain",
            ErrorCategory::Email => "email",
            ErrorCategory::Path => "path",
            ErrorCategory::Timing => "timing",
            ErrorCategory::Certificate => "certificate",
        };
        f.write_str(name)
    }
}

/// A blocking validation problem
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A non-blocking observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated validation outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors joined on one line
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Check that `domain` is a syntactically valid DNS name with at least two labels
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Minimal shape check for a contact address
pub fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, host)) => {
            !local.is_empty() && !local.contains(char::is_whitespace) && is_valid_domain(host)
        }
        None => false,
    }
}

/// Validate a domain value
pub fn validate_domain(domain: &str) -> ValidationResult {
    let mut result = ValidationResult::new();
    if !is_valid_domain(domain) {
        result.add_error(ValidationError::new(
            ErrorCategory::Domain,
            format!("'{}' is not a valid domain name", domain),
        ));
    }
    result
}

/// Validate a contact email value
pub fn validate_email(email: &str) -> ValidationResult {
    let mut result = ValidationResult::new();
    if !is_valid_email(email) {
        result.add_error(ValidationError::new(
            ErrorCategory::Email,
            format!("'{}' is not a valid contact email", email),
        ));
    }
    result
}

/// Structural validation of a loaded configuration.
///
/// `domain` and `email` are only checked when present; workflows that need
/// them resolve and check them when building a run.
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Some(ref domain) = config.domain {
        result.merge(validate_domain(domain));
    }
    if let Some(ref email) = config.email {
        result.merge(validate_email(email));
    }
    for extra in &config.acme.extra_domains {
        result.merge(validate_domain(extra));
    }

    let paths = &config.paths;
    for (name, path) in [
        ("config-dir", &paths.config_dir),
        ("challenge-dir", &paths.challenge_dir),
        ("cert-dir", &paths.cert_dir),
    ] {
        if path.as_os_str().is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Path,
                format!("paths.{} must not be empty", name),
            ));
        }
    }
    if paths.config_dir == paths.challenge_dir {
        result.add_error(ValidationError::new(
            ErrorCategory::Path,
            "paths.config-dir and paths.challenge-dir must differ",
        ));
    }

    let timing = &config.timing;
    if timing.health_max_attempts == 0 || timing.probe_max_attempts == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            "attempt counts must be at least 1",
        ));
    }
    if timing.health_deadline_secs == 0 || timing.probe_deadline_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            "deadlines must be at least 1 second",
        ));
    }
    if timing.initial_delay_ms > timing.max_delay_ms {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            format!(
                "timing.initial-delay-ms ({}) exceeds timing.max-delay-ms ({})",
                timing.initial_delay_ms, timing.max_delay_ms
            ),
        ));
    }

    result.merge(lint::lint_config(config));
    result
}
