//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::validate::ValidationResult;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid KDL syntax: {0}")]
    Syntax(String),

    #[error("{0}")]
    Schema(String),

    #[error("configuration is invalid: {}", .0.summary())]
    Invalid(ValidationResult),

    #[error("missing required setting '{0}' (set it in the config file, the environment, or on the command line)")]
    Missing(&'static str),
}

impl From<kdl::KdlError> for ConfigError {
    fn from(err: kdl::KdlError) -> Self {
        // Render with miette so the operator sees the offending span
        let report = miette::Report::new(err);
        ConfigError::Syntax(format!("{:?}", report))
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
