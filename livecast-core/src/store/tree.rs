//! JSON tree helpers shared by the store backends.
//!
//! The tree never holds `null` or empty objects: writing `null` removes the
//! node and removals prune parents left empty.

use serde_json::{Map, Value};

/// Node at `segments` below `root`
pub fn get<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(*segment)?;
    }
    Some(node)
}

/// Replace the node at `segments`, creating (or overwriting leaves with)
/// objects along the way. A `null` value removes the node.
pub fn set(root: &mut Value, segments: &[&str], value: Value) {
    if is_absent(&value) {
        remove(root, segments);
        return;
    }
    insert(root, segments, value);
}

fn insert(node: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry((*first).to_string()).or_insert(Value::Null);
        insert(child, rest, value);
    }
}

/// Remove the node at `segments` and prune empty parents.
/// Returns whether anything was removed.
pub fn remove(root: &mut Value, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        let existed = !root.is_null();
        *root = Value::Null;
        return existed;
    };
    let Some(map) = root.as_object_mut() else {
        return false;
    };
    let removed = if rest.is_empty() {
        map.remove(*first).is_some()
    } else {
        match map.get_mut(*first) {
            Some(child) => {
                let removed = remove(child, rest);
                if is_absent(child) {
                    map.remove(*first);
                }
                removed
            }
            None => false,
        }
    };
    if map.is_empty() {
        *root = Value::Null;
    }
    removed
}

/// Deep-merge `source` into `target`; objects merge key by key, anything else replaces
pub fn merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

/// Children of an object node sorted by key
pub fn children(value: &Value) -> Vec<(&str, &Value)> {
    let mut out: Vec<(&str, &Value)> = value
        .as_object()
        .map(|map| map.iter().map(|(k, v)| (k.as_str(), v)).collect())
        .unwrap_or_default();
    out.sort_by(|a, b| a.0.cmp(b.0));
    out
}

/// `null` and `{}` are never stored, writing either removes the node
pub fn is_absent(value: &Value) -> bool {
    value.is_null() || value.as_object().is_some_and(Map::is_empty)
}
