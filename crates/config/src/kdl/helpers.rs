//! Small accessors over KDL nodes.
//!
//! Settings are written as child nodes with a single argument, e.g.
//! `listen "0.0.0.0:7800"` inside a `hub { }` block.

use anyhow::Result;
use kdl::{KdlNode, KdlValue};

fn positional(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
}

/// First positional argument of `node`, if it is a string.
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    positional(node)
        .next()
        .and_then(KdlValue::as_string)
        .map(str::to_string)
}

/// All positional string arguments of `node`.
pub fn get_string_args(node: &KdlNode) -> Vec<String> {
    positional(node)
        .filter_map(KdlValue::as_string)
        .map(str::to_string)
        .collect()
}

pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    child(node, name).and_then(get_first_arg_string)
}

pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    child(node, name)
        .and_then(|c| positional(c).next())
        .and_then(KdlValue::as_integer)
}

/// Non-negative integer setting. Negative or oversized values are errors.
pub fn get_u64_entry(node: &KdlNode, name: &str) -> Result<Option<u64>> {
    match get_int_entry(node, name) {
        None => Ok(None),
        Some(value) => u64::try_from(value)
            .map(Some)
            .map_err(|_| anyhow::anyhow!("'{}' must be a non-negative integer, got {}", name, value)),
    }
}

/// Every child of `node` named `name`.
pub fn children_named<'a>(node: &'a KdlNode, name: &'a str) -> impl Iterator<Item = &'a KdlNode> {
    node.children()
        .into_iter()
        .flat_map(|doc| doc.nodes().iter())
        .filter(move |child| child.name().value() == name)
}
