//! Small accessors over the KDL document model.
//!
//! Settings are written as child nodes with a single argument:
//!
//! ```kdl
//! proxy {
//!     service "nginx"
//!     log-lines 20
//! }
//! ```

use kdl::{KdlDocument, KdlNode, KdlValue};

use crate::error::{ConfigError, ConfigResult};

/// First positional argument of a node
pub fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// First positional argument of a node, as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    get_first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// All positional string arguments of a node
pub fn get_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .filter_map(|entry| entry.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn child<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlNode> {
    doc.nodes().iter().find(|n| n.name().value() == name)
}

/// String setting `name "value"` in a document
pub fn doc_string(doc: &KdlDocument, name: &str) -> ConfigResult<Option<String>> {
    let Some(node) = child(doc, name) else {
        return Ok(None);
    };
    match get_first_arg(node) {
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| type_error(name, "a string", value)),
        None => Err(ConfigError::Schema(format!(
            "'{}' requires a value, e.g., {} \"...\"",
            name, name
        ))),
    }
}

/// Boolean setting `name #true` in a document
pub fn doc_bool(doc: &KdlDocument, name: &str) -> ConfigResult<Option<bool>> {
    let Some(node) = child(doc, name) else {
        return Ok(None);
    };
    match get_first_arg(node) {
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| type_error(name, "a boolean (#true or #false)", value)),
        // A bare flag node means enabled
        None => Ok(Some(true)),
    }
}

/// Non-negative integer setting `name 42` in a document
pub fn doc_u64(doc: &KdlDocument, name: &str) -> ConfigResult<Option<u64>> {
    let Some(node) = child(doc, name) else {
        return Ok(None);
    };
    let value = get_first_arg(node).ok_or_else(|| {
        ConfigError::Schema(format!("'{}' requires a value, e.g., {} 30", name, name))
    })?;
    let int = value
        .as_integer()
        .ok_or_else(|| type_error(name, "an integer", value))?;
    u64::try_from(int)
        .map(Some)
        .map_err(|_| ConfigError::Schema(format!("'{}' must not be negative (got {})", name, int)))
}

/// Same as [`doc_u64`], narrowed to `u32`
pub fn doc_u32(doc: &KdlDocument, name: &str) -> ConfigResult<Option<u32>> {
    match doc_u64(doc, name)? {
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| ConfigError::Schema(format!("'{}' is too large (got {})", name, v))),
        None => Ok(None),
    }
}

/// Positional string arguments of `name "a" "b"` in a document
pub fn doc_strings(doc: &KdlDocument, name: &str) -> Vec<String> {
    child(doc, name).map(get_string_args).unwrap_or_default()
}

/// Reject child nodes that are not in `known`
pub fn check_known(doc: &KdlDocument, section: &str, known: &[&str]) -> ConfigResult<()> {
    for node in doc.nodes() {
        let name = node.name().value();
        if !known.contains(&name) {
            return Err(ConfigError::Schema(format!(
                "unknown setting '{}' in {}. Valid settings: {}",
                name,
                section,
                known.join(", ")
            )));
        }
    }
    Ok(())
}

fn type_error(name: &str, expected: &str, got: &KdlValue) -> ConfigError {
    ConfigError::Schema(format!("'{}' must be {} (got {})", name, expected, got))
}
