//! Cache keys and opaque identifiers.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Request fields that never change what is being computed.
pub const IGNORED_FIELDS: &[&str] = &[
    "offset",
    "limit",
    "cursor",
    "page",
    "page_size",
    "refresh",
    "force_refresh",
];

/// Deterministic key over the semantically relevant request fields.
///
/// Top-level pagination and refresh fields are dropped, object keys are
/// sorted at every depth, and the SHA-256 of the resulting JSON is hex
/// encoded.
pub fn cache_key(fields: &Value) -> String {
    let relevant = match fields {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !IGNORED_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    };
    let mut hasher = Sha256::new();
    write_canonical(&relevant, &mut hasher);
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            hasher.update(b"{");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                if let Some(v) = map.get(key) {
                    write_canonical(v, hasher);
                }
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                write_canonical(item, hasher);
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

/// Fresh, unguessable identifier handed to callers.
pub fn new_opaque_id() -> String {
    format!("cf_{}", uuid::Uuid::new_v4().simple())
}

/// Whether `candidate` has the shape of an opaque id rather than a key.
pub fn is_opaque_id(candidate: &str) -> bool {
    candidate.starts_with("cf_")
}

/// Build a request-fields object from key/value pairs.
pub fn fields<I, K>(pairs: I) -> Value
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    Value::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect::<Map<_, _>>())
}
