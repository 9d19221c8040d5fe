//! KDL node accessors.
//!
//! Settings are child nodes with a single positional argument, e.g.
//! `email "ops@example.com"`. Lists are child nodes with several arguments,
//! e.g. `domains "a.example.com" "b.example.com"`.

use kdl::{KdlNode, KdlValue};

/// Find a child node by name
pub fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

/// Positional (unnamed) argument values of a node
pub fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

/// First positional argument of a node as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    args(node).next()?.as_string().map(str::to_string)
}

/// Second positional argument of a node as a string
pub fn get_second_arg_string(node: &KdlNode) -> Option<String> {
    args(node).nth(1)?.as_string().map(str::to_string)
}

/// String setting `name "value"` inside `node`
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    child(node, name).and_then(get_first_arg_string)
}

/// Integer setting `name 42` inside `node`
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    child(node, name).and_then(|c| args(c).next()?.as_integer())
}

/// Boolean setting `name #true` inside `node`
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    child(node, name).and_then(|c| args(c).next()?.as_bool())
}

/// All string arguments of setting `name "a" "b" ...` inside `node`
pub fn get_string_list(node: &KdlNode, name: &str) -> Vec<String> {
    child(node, name)
        .map(|c| {
            args(c)
                .filter_map(|v| v.as_string().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Non-negative integer setting, rejecting values that do not fit
pub fn get_u64_entry(node: &KdlNode, name: &str) -> anyhow::Result<Option<u64>> {
    match get_int_entry(node, name) {
        None => Ok(None),
        Some(v) => u64::try_from(v)
            .map(Some)
            .map_err(|_| anyhow::anyhow!("'{}' must be a non-negative integer, got {}", name, v)),
    }
}
