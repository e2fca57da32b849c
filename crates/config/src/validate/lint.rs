//! Configuration linting for risky settings
//!
//! Lints never block a run; they point at settings that are legitimate in
//! some situations but usually a mistake in production.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Lint configuration for risky settings
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.acme.staging {
        result.add_warning(ValidationWarning::new(
            "ACME staging is enabled; issued certificates will not be trusted by browsers",
        ));
    }

    if config.preflight.allow_ip_mismatch {
        result.add_warning(ValidationWarning::new(
            "allow-ip-mismatch is enabled; issuance will be attempted even if the domain points elsewhere",
        ));
    }

    if config.preflight.public_ip_url.is_none() {
        result.add_warning(ValidationWarning::new(
            "public-ip-url is unset; the domain/IP comparison is skipped",
        ));
    }

    if config.proxy.health_url.is_none() {
        result.add_warning(ValidationWarning::new(format!(
            "proxy.health-url is unset; falling back to the container health state of '{}'",
            config.proxy.service
        )));
        if config.proxy.health_body.is_some() {
            result.add_warning(ValidationWarning::new(
                "proxy.health-body has no effect without proxy.health-url",
            ));
        }
    }

    if config.paths.challenge_dir.starts_with(&config.paths.config_dir) {
        result.add_warning(ValidationWarning::new(
            "paths.challenge-dir is inside paths.config-dir; challenge files will be visible to the proxy configuration loader",
        ));
    }

    if config.acme.rsa_key_size < 2048 {
        result.add_warning(ValidationWarning::new(format!(
            "acme.rsa-key-size {} is below 2048 bits and will be rejected by most CAs",
            config.acme.rsa_key_size
        )));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.proxy.health_url = Some("http://127.0.0.1/health".to_string());
        config
    }

    #[test]
    fn test_quiet_config_has_no_warnings() {
        let result = lint_config(&quiet_config());
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn test_staging_warns() {
        let mut config = quiet_config();
        config.acme.staging = true;

        let result = lint_config(&config);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("staging"));
    }

    #[test]
    fn test_missing_health_url_warns() {
        let mut config = quiet_config();
        config.proxy.health_url = None;
        config.proxy.health_body = Some("healthy".to_string());

        let result = lint_config(&config);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].message.contains("container health state of 'nginx'"));
    }

    #[test]
    fn test_nested_challenge_dir_warns() {
        let mut config = quiet_config();
        config.paths.config_dir = PathBuf::from("/srv/nginx");
        config.paths.challenge_dir = PathBuf::from("/srv/nginx/www");

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("inside paths.config-dir")));
    }
}
