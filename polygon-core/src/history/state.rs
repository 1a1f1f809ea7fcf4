//! Document state helpers: hashing, deltas, merging and integrity checks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{DocumentState, StateMetadata};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn to_canonical(state: &DocumentState) -> Value {
    serde_json::to_value(state)
        .map(|v| sort_keys(&v))
        .unwrap_or(Value::Null)
}

/// FNV-1a 64-bit hash of the key-sorted JSON form, as 16 hex digits.
pub fn state_hash(state: &DocumentState) -> String {
    let text = to_canonical(state).to_string();
    let hash = text.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    format!("{hash:016x}")
}

/// Serialized size in bytes.
pub fn state_size(state: &DocumentState) -> usize {
    serde_json::to_vec(state).map(|v| v.len()).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// Top-level fields whose values differ between the two states.
pub fn state_delta(old: &DocumentState, new: &DocumentState) -> BTreeMap<String, FieldChange> {
    let (Value::Object(old), Value::Object(new)) = (to_canonical(old), to_canonical(new)) else {
        return BTreeMap::new();
    };
    let mut delta = BTreeMap::new();
    let keys: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        let before = old.get(key).cloned().unwrap_or(Value::Null);
        let after = new.get(key).cloned().unwrap_or(Value::Null);
        if before != after {
            delta.insert(key.clone(), FieldChange { old: before, new: after });
        }
    }
    delta
}

/// Union of both states; `b` wins per entity.
pub fn merge_states(a: &DocumentState, b: &DocumentState) -> DocumentState {
    fn union(
        a: &BTreeMap<String, Value>,
        b: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let mut merged = a.clone();
        merged.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    DocumentState {
        version: a.version.max(b.version),
        sketches: union(&a.sketches, &b.sketches),
        objects: union(&a.objects, &b.objects),
        materials: union(&a.materials, &b.materials),
        settings: union(&a.settings, &b.settings),
        metadata: StateMetadata {
            last_modified: a.metadata.last_modified.max(b.metadata.last_modified),
            last_modified_by: b.metadata.last_modified_by.or(a.metadata.last_modified_by),
        },
    }
}

/// Integrity problems: objects whose `sourceSketchId` names a missing sketch.
pub fn validate_state(state: &DocumentState) -> Vec<String> {
    state
        .objects
        .iter()
        .filter_map(|(id, object)| {
            let sketch = object.get("sourceSketchId")?.as_str()?;
            (!state.sketches.contains_key(sketch))
                .then(|| format!("Object {id} references non-existent sketch {sketch}"))
        })
        .collect()
}
