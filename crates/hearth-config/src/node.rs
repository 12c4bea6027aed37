//! Helpers for pulling values out of KDL nodes.

use kdl::{KdlNode, KdlValue};
use std::collections::BTreeMap;

use crate::{ConfigError, ConfigResult};

pub(crate) fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn string_arg(node: &KdlNode, index: usize) -> Option<String> {
    args(node)
        .nth(index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn required_string_arg(node: &KdlNode, index: usize, what: &str) -> ConfigResult<String> {
    string_arg(node, index).ok_or_else(|| ConfigError::MissingField(what.to_string()))
}

/// All positional arguments, rendering numbers and booleans as text.
pub(crate) fn string_args(node: &KdlNode) -> Vec<String> {
    args(node).filter_map(value_to_string).collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Named properties of a node as text.
pub(crate) fn string_props(node: &KdlNode) -> BTreeMap<String, String> {
    node.entries()
        .iter()
        .filter_map(|e| {
            let name = e.name()?.value().to_string();
            let value = value_to_string(e.value())?;
            Some((name, value))
        })
        .collect()
}

pub(crate) fn u64_arg(node: &KdlNode, index: usize, what: &str) -> ConfigResult<u64> {
    let value = args(node)
        .nth(index)
        .ok_or_else(|| ConfigError::MissingField(what.to_string()))?;
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: what.to_string(),
            message: format!("expected a non-negative integer, got {value}"),
        })
}

pub(crate) fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn value_to_string(value: &KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        return Some(s.to_string());
    }
    if let Some(i) = value.as_integer() {
        return Some(i.to_string());
    }
    if let Some(b) = value.as_bool() {
        return Some(b.to_string());
    }
    value.as_float().map(|f| f.to_string())
}

/// `resource "name" version="x"` children as a capability map.
pub(crate) fn resources(node: &KdlNode) -> ConfigResult<BTreeMap<String, Option<String>>> {
    let mut resources = BTreeMap::new();
    for child in children(node).filter(|c| c.name().value() == "resource") {
        let name = required_string_arg(child, 0, "resource name")?;
        resources.insert(name, string_prop(child, "version"));
    }
    Ok(resources)
}
