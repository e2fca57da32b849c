//! Configuration for the certpilot certificate lifecycle orchestrator.
//!
//! Configuration lives in a KDL file (`certpilot.kdl`). Every setting has a
//! default except `domain` and `email`, which the issuing workflows require.
//! Resolution order for the file itself: `--config` flag, then the
//! `CERTPILOT_CONFIG` environment variable, then built-in defaults.
//!
//! ```kdl
//! domain "example.com"
//! email "admin@example.com"
//!
//! paths {
//!     config-dir "/srv/app/nginx/conf.d"
//!     challenge-dir "/srv/app/certbot/www"
//!     cert-dir "/srv/app/certbot/conf"
//! }
//! ```

pub mod error;
mod kdl;
pub mod sections;
pub mod validate;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub use error::{ConfigError, ConfigResult};
pub use sections::{
    AcmeConfig, PathsConfig, PreflightConfig, ProxyConfig, RuntimeConfig, TimingConfig,
};
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

#[cfg(feature = "validation")]
pub use validate::certs::{inspect_bundle, validate_bundle, BundleInfo, BundlePaths};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "CERTPILOT_CONFIG";
/// Environment variable overriding `domain`
pub const DOMAIN_ENV: &str = "CERTPILOT_DOMAIN";
/// Environment variable overriding `email`
pub const EMAIL_ENV: &str = "CERTPILOT_EMAIL";

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub domain: Option<String>,
    pub email: Option<String>,
    pub paths: PathsConfig,
    pub proxy: ProxyConfig,
    pub runtime: RuntimeConfig,
    pub acme: AcmeConfig,
    pub preflight: PreflightConfig,
    pub timing: TimingConfig,
}

impl Config {
    /// Parse configuration from KDL text
    pub fn from_kdl(text: &str) -> ConfigResult<Self> {
        kdl::parse_config(text)
    }

    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_kdl(&text)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from an explicit path, the `CERTPILOT_CONFIG` file, or defaults,
    /// then apply environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let env_path = std::env::var_os(CONFIG_ENV);
        let mut config = match path.or(env_path.as_deref().map(Path::new)) {
            Some(p) => Self::from_file(p)?,
            None => {
                debug!("No configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `CERTPILOT_DOMAIN` / `CERTPILOT_EMAIL` overrides
    pub fn apply_env(&mut self) {
        if let Some(domain) = non_empty_env(DOMAIN_ENV) {
            debug!(domain = %domain, "Domain overridden from environment");
            self.domain = Some(domain);
        }
        if let Some(email) = non_empty_env(EMAIL_ENV) {
            debug!("Email overridden from environment");
            self.email = Some(email);
        }
    }

    /// Structural validation plus lint warnings
    pub fn validate(&self) -> ValidationResult {
        validate::validate_config(self)
    }

    /// Domain, or an error naming the missing setting
    pub fn require_domain(&self) -> ConfigResult<&str> {
        self.domain.as_deref().ok_or(ConfigError::Missing("domain"))
    }

    /// Contact email, or an error naming the missing setting
    pub fn require_email(&self) -> ConfigResult<&str> {
        self.email.as_deref().ok_or(ConfigError::Missing("email"))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
