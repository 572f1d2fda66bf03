//! Recursive merge for catalog section documents.
//!
//! Sections are free-form JSON owned by individual stages. Merging overlays a
//! patch onto the stored document key by key and never removes anything
//! unless the patch carries an explicit tombstone.
use serde_json::{Map, Value};

/// Marker key for an explicit delete inside a patch.
pub const TOMBSTONE_KEY: &str = "$delete";

/// Build the tombstone value that removes a key when merged.
pub fn tombstone() -> Value {
    let mut map = Map::new();
    map.insert(TOMBSTONE_KEY.to_string(), Value::Bool(true));
    Value::Object(map)
}

/// Return true when `value` is exactly `{"$delete": true}`.
pub fn is_tombstone(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get(TOMBSTONE_KEY) == Some(&Value::Bool(true)),
        _ => false,
    }
}

/// Merge `patch` into `target`.
///
/// Objects merge key by key and recurse; every other value replaces the
/// existing one outright. Tombstones remove the matching key and are never
/// stored themselves.
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        merge_maps(target_map, patch_map);
    }
}

fn merge_maps(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if is_tombstone(value) {
            target.remove(key);
            continue;
        }
        match target.get_mut(key) {
            Some(existing) if existing.is_object() && value.is_object() => merge(existing, value),
            _ => {
                target.insert(key.clone(), strip_tombstones(value));
            }
        }
    }
}

// A fresh subtree has nothing to delete from, so nested tombstones are dropped.
fn strip_tombstones(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !is_tombstone(v))
                .map(|(k, v)| (k.clone(), strip_tombstones(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
