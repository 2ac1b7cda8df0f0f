//! Canonical serialization and hashing of the revisioned part of a spec.

use serde_json::{Map, Value, json};

use crate::crd::ApplicationSpec;

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Characters that cannot form offensive words; see `SafeEncodeString` in apimachinery.
const SAFE_ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&canonicalize(value))
}

/// The revisioned projection of a spec: its resource templates wrapped as a
/// replace patch, `{"$patch":"replace","spec":{"resources":[...]}}`.
pub fn revision_document(spec: &ApplicationSpec) -> Result<Value, serde_json::Error> {
    let resources = serde_json::to_value(&spec.resources)?;
    Ok(json!({
        "$patch": "replace",
        "spec": { "resources": resources },
    }))
}

pub fn canonical_payload(spec: &ApplicationSpec) -> Result<Vec<u8>, serde_json::Error> {
    canonical_bytes(&revision_document(spec)?)
}

pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV32_PRIME)
    })
}

pub fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| SAFE_ALPHANUMS[b as usize % SAFE_ALPHANUMS.len()] as char)
        .collect()
}

/// Label- and name-safe content hash of a canonical payload.
pub fn content_hash(payload: &[u8]) -> String {
    safe_encode(&fnv1a32(payload).to_string())
}
