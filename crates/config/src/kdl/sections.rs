//! Section-level KDL parsing.

use std::path::PathBuf;
use tracing::trace;

use kdl::{KdlDocument, KdlNode};

use crate::error::{ConfigError, ConfigResult};
use crate::sections::*;

use super::helpers::{check_known, doc_bool, doc_string, doc_strings, doc_u32, doc_u64};

fn section_body<'a>(node: &'a KdlNode, section: &str) -> ConfigResult<Option<&'a KdlDocument>> {
    if node.entries().iter().any(|e| e.name().is_none()) {
        return Err(ConfigError::Schema(format!(
            "'{}' is a block and takes no arguments, e.g., {} {{ ... }}",
            section, section
        )));
    }
    Ok(node.children())
}

/// Parse the `paths { ... }` block
pub fn parse_paths(node: &KdlNode) -> ConfigResult<PathsConfig> {
    trace!("Parsing paths block");
    let mut config = PathsConfig::default();
    let Some(doc) = section_body(node, "paths")? else {
        return Ok(config);
    };
    check_known(doc, "paths", &["config-dir", "challenge-dir", "cert-dir"])?;

    if let Some(v) = doc_string(doc, "config-dir")? {
        config.config_dir = PathBuf::from(v);
    }
    if let Some(v) = doc_string(doc, "challenge-dir")? {
        config.challenge_dir = PathBuf::from(v);
    }
    if let Some(v) = doc_string(doc, "cert-dir")? {
        config.cert_dir = PathBuf::from(v);
    }

    trace!(
        config_dir = %config.config_dir.display(),
        challenge_dir = %config.challenge_dir.display(),
        cert_dir = %config.cert_dir.display(),
        "Parsed paths"
    );
    Ok(config)
}

/// Parse the `proxy { ... }` block
pub fn parse_proxy(node: &KdlNode) -> ConfigResult<ProxyConfig> {
    trace!("Parsing proxy block");
    let mut config = ProxyConfig::default();
    let Some(doc) = section_body(node, "proxy")? else {
        return Ok(config);
    };
    check_known(
        doc,
        "proxy",
        &["service", "container-config-dir", "health-url", "health-body", "log-lines"],
    )?;

    if let Some(v) = doc_string(doc, "service")? {
        config.service = v;
    }
    if let Some(v) = doc_string(doc, "container-config-dir")? {
        config.container_config_dir = PathBuf::from(v);
    }
    config.health_url = doc_string(doc, "health-url")?;
    config.health_body = doc_string(doc, "health-body")?;
    config.log_lines = doc_u64(doc, "log-lines")?
        .map(|v| v as usize)
        .unwrap_or_else(default_log_lines);

    trace!(
        service = %config.service,
        health_url = ?config.health_url,
        "Parsed proxy"
    );
    Ok(config)
}

/// Parse the `runtime { ... }` block
pub fn parse_runtime(node: &KdlNode) -> ConfigResult<RuntimeConfig> {
    trace!("Parsing runtime block");
    let mut config = RuntimeConfig::default();
    let Some(doc) = section_body(node, "runtime")? else {
        return Ok(config);
    };
    check_known(doc, "runtime", &["docker-binary", "compose-file", "project"])?;

    if let Some(v) = doc_string(doc, "docker-binary")? {
        config.docker_binary = v;
    }
    config.compose_file = doc_string(doc, "compose-file")?.map(PathBuf::from);
    config.project = doc_string(doc, "project")?;
    Ok(config)
}

/// Parse the `acme { ... }` block
pub fn parse_acme(node: &KdlNode) -> ConfigResult<AcmeConfig> {
    trace!("Parsing acme block");
    let mut config = AcmeConfig::default();
    let Some(doc) = section_body(node, "acme")? else {
        return Ok(config);
    };
    check_known(
        doc,
        "acme",
        &[
            "image",
            "staging",
            "rsa-key-size",
            "container-webroot",
            "container-cert-dir",
            "extra-domains",
        ],
    )?;

    if let Some(v) = doc_string(doc, "image")? {
        config.image = v;
    }
    if let Some(v) = doc_bool(doc, "staging")? {
        config.staging = v;
    }
    if let Some(v) = doc_u32(doc, "rsa-key-size")? {
        config.rsa_key_size = v;
    }
    if let Some(v) = doc_string(doc, "container-webroot")? {
        config.container_webroot = PathBuf::from(v);
    }
    if let Some(v) = doc_string(doc, "container-cert-dir")? {
        config.container_cert_dir = PathBuf::from(v);
    }
    config.extra_domains = doc_strings(doc, "extra-domains");

    trace!(
        image = %config.image,
        staging = config.staging,
        extra_domains = config.extra_domains.len(),
        "Parsed acme"
    );
    Ok(config)
}

/// Parse the `preflight { ... }` block
pub fn parse_preflight(node: &KdlNode) -> ConfigResult<PreflightConfig> {
    trace!("Parsing preflight block");
    let mut config = PreflightConfig::default();
    let Some(doc) = section_body(node, "preflight")? else {
        return Ok(config);
    };
    check_known(doc, "preflight", &["allow-ip-mismatch", "public-ip-url"])?;

    if let Some(v) = doc_bool(doc, "allow-ip-mismatch")? {
        config.allow_ip_mismatch = v;
    }
    if let Some(v) = doc_string(doc, "public-ip-url")? {
        // An empty URL disables the public IP comparison
        config.public_ip_url = if v.trim().is_empty() { None } else { Some(v) };
    }
    Ok(config)
}

/// Parse the `timing { ... }` block
pub fn parse_timing(node: &KdlNode) -> ConfigResult<TimingConfig> {
    trace!("Parsing timing block");
    let mut config = TimingConfig::default();
    let Some(doc) = section_body(node, "timing")? else {
        return Ok(config);
    };
    check_known(
        doc,
        "timing",
        &[
            "health-deadline-secs",
            "health-max-attempts",
            "probe-deadline-secs",
            "probe-max-attempts",
            "initial-delay-ms",
            "max-delay-ms",
        ],
    )?;

    if let Some(v) = doc_u64(doc, "health-deadline-secs")? {
        config.health_deadline_secs = v;
    }
    if let Some(v) = doc_u32(doc, "health-max-attempts")? {
        config.health_max_attempts = v;
    }
    if let Some(v) = doc_u64(doc, "probe-deadline-secs")? {
        config.probe_deadline_secs = v;
    }
    if let Some(v) = doc_u32(doc, "probe-max-attempts")? {
        config.probe_max_attempts = v;
    }
    if let Some(v) = doc_u64(doc, "initial-delay-ms")? {
        config.initial_delay_ms = v;
    }
    if let Some(v) = doc_u64(doc, "max-delay-ms")? {
        config.max_delay_ms = v;
    }

    trace!(
        health_deadline_secs = config.health_deadline_secs,
        probe_deadline_secs = config.probe_deadline_secs,
        "Parsed timing"
    );
    Ok(config)
}
