//! KDL configuration parsing.

mod helpers;
mod sections;

use kdl::KdlDocument;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::Config;

use helpers::doc_string;
use sections::{parse_acme, parse_paths, parse_preflight, parse_proxy, parse_runtime, parse_timing};

const TOP_LEVEL: &[&str] = &[
    "domain", "email", "paths", "proxy", "runtime", "acme", "preflight", "timing",
];

/// Parse a full configuration document
pub fn parse_config(text: &str) -> ConfigResult<Config> {
    let doc: KdlDocument = text.parse()?;
    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "domain" | "email" => {}
            "paths" => config.paths = parse_paths(node)?,
            "proxy" => config.proxy = parse_proxy(node)?,
            "runtime" => config.runtime = parse_runtime(node)?,
            "acme" => config.acme = parse_acme(node)?,
            "preflight" => config.preflight = parse_preflight(node)?,
            "timing" => config.timing = parse_timing(node)?,
            other => {
                return Err(ConfigError::Schema(format!(
                    "unknown top-level node '{}'. Valid nodes: {}",
                    other,
                    TOP_LEVEL.join(", ")
                )));
            }
        }
    }

    config.domain = doc_string(&doc, "domain")?;
    config.email = doc_string(&doc, "email")?;

    debug!(
        domain = ?config.domain,
        email = ?config.email,
        "Parsed KDL configuration"
    );
    Ok(config)
}
