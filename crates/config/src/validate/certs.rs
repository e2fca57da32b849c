//! Certificate bundle inspection
//!
//! Reads the bundle the certificate authority client writes to
//! `<cert-dir>/live/<domain>/{fullchain.pem, privkey.pem}` and extracts the
//! validity window of the leaf certificate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Certificates expiring within this many days produce a warning
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Location of a domain's bundle files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
}

impl BundlePaths {
    pub fn new(cert_dir: &Path, domain: &str) -> Self {
        let live = cert_dir.join("live").join(domain);
        Self {
            fullchain: live.join("fullchain.pem"),
            privkey: live.join("privkey.pem"),
        }
    }

    /// Both files are present
    pub fn exist(&self) -> bool {
        self.fullchain.is_file() && self.privkey.is_file()
    }
}

/// Parsed facts about an issued bundle
#[derive(Debug, Clone, Serialize)]
pub struct BundleInfo {
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl BundleInfo {
    /// Whole days until expiry (negative once expired)
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }
}

/// Inspect the bundle for `domain`.
///
/// Returns `Ok(None)` when either file is missing and an error when the
/// files exist but the leaf certificate cannot be parsed.
pub fn inspect_bundle(cert_dir: &Path, domain: &str) -> Result<Option<BundleInfo>, ValidationError> {
    let paths = BundlePaths::new(cert_dir, domain);
    if !paths.exist() {
        return Ok(None);
    }

    let cert_pem = fs::read(&paths.fullchain).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read certificate {:?}: {}", paths.fullchain, e),
        )
    })?;

    // The first block of fullchain.pem is the leaf
    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse certificate {:?}: {}", paths.fullchain, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", paths.fullchain, e),
        )
    })?;

    let validity = cert.validity();
    let not_before = to_utc(validity.not_before.to_datetime().unix_timestamp());
    let not_after = to_utc(validity.not_after.to_datetime().unix_timestamp());

    Ok(Some(BundleInfo {
        subject: cert.subject().to_string(),
        fullchain: paths.fullchain,
        privkey: paths.privkey,
        not_before,
        not_after,
    }))
}

fn to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Validate the bundle for `domain` as a precondition for TLS serving
pub fn validate_bundle(cert_dir: &Path, domain: &str, now: DateTime<Utc>) -> ValidationResult {
    let mut result = ValidationResult::new();

    match inspect_bundle(cert_dir, domain) {
        Ok(None) => {
            let paths = BundlePaths::new(cert_dir, domain);
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "Certificate bundle not found: {:?} / {:?}",
                    paths.fullchain, paths.privkey
                ),
            ));
        }
        Ok(Some(info)) => {
            if info.is_expired(now) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Certificate,
                    format!(
                        "Certificate expired: {:?} (expired at {})",
                        info.fullchain, info.not_after
                    ),
                ));
            } else if info.days_remaining(now) < EXPIRY_WARNING_DAYS {
                result.add_warning(ValidationWarning::new(format!(
                    "Certificate expires soon: {:?} (expires at {})",
                    info.fullchain, info.not_after
                )));
            }
        }
        Err(e) => result.add_error(e),
    }

    result
}
