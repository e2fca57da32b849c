//! Shared domain types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// File name of the live proxy configuration inside the config directory
pub const ACTIVE_FILE: &str = "active.conf";

/// File name of the single-slot backup inside the config directory
pub const BACKUP_FILE: &str = "active.conf.backup";

/// File name of the run lock inside the config directory
pub const LOCK_FILE: &str = ".certpilot.lock";

/// HTTP-01 challenge path, relative to the webroot
pub const ACME_CHALLENGE_DIR: &str = ".well-known/acme-challenge";

/// HTTP-01 challenge path prefix as seen in request URLs
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// A reverse-proxy configuration variant.
///
/// `Bootstrap` serves plain HTTP (ACME challenge plus redirect) and is valid
/// with or without a certificate on disk. `Full` terminates TLS and only
/// loads when the certificate bundle exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigVariant {
    Bootstrap,
    Full,
}

impl ConfigVariant {
    /// Source file name of this variant inside the config directory
    pub fn file_name(&self) -> &'static str {
        match self {
            ConfigVariant::Bootstrap => "bootstrap.conf",
            ConfigVariant::Full => "full.conf",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigVariant::Bootstrap => "bootstrap",
            ConfigVariant::Full => "full",
        }
    }

    /// Whether the proxy needs a certificate bundle to load this variant
    pub fn requires_certificate(&self) -> bool {
        matches!(self, ConfigVariant::Full)
    }
}

impl fmt::Display for ConfigVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown configuration variant '{0}' (expected 'bootstrap' or 'full')")]
pub struct UnknownVariant(pub String);

impl FromStr for ConfigVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(ConfigVariant::Bootstrap),
            "full" => Ok(ConfigVariant::Full),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// What the live configuration file currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveState {
    /// Byte-identical to one of the known variants
    Variant(ConfigVariant),
    /// Present but matches neither variant (hand-edited or stale)
    Custom,
    /// No live configuration file
    Missing,
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveState::Variant(v) => write!(f, "{v}"),
            ActiveState::Custom => f.write_str("custom"),
            ActiveState::Missing => f.write_str("missing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parse() {
        assert_eq!("bootstrap".parse::<ConfigVariant>().unwrap(), ConfigVariant::Bootstrap);
        assert_eq!(" FULL ".parse::<ConfigVariant>().unwrap(), ConfigVariant::Full);
        assert!("tls".parse::<ConfigVariant>().is_err());
    }

    #[test]
    fn test_variant_files() {
        assert_eq!(ConfigVariant::Bootstrap.file_name(), "bootstrap.conf");
        assert_eq!(ConfigVariant::Full.file_name(), "full.conf");
        assert!(ConfigVariant::Full.requires_certificate());
        assert!(!ConfigVariant::Bootstrap.requires_certificate());
    }

    #[test]
    fn test_active_state_display() {
        assert_eq!(ActiveState::Variant(ConfigVariant::Full).to_string(), "full");
        assert_eq!(ActiveState::Custom.to_string(), "custom");
        assert_eq!(ActiveState::Missing.to_string(), "missing");
    }
}
