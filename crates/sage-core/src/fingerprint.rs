//! Deterministic fingerprint derivation for prediction requests
//!
//! A fingerprint identifies a logically identical request: same model,
//! same resolved version, same feature mapping regardless of key order.
//! It doubles as the cache key, so a model-version bump naturally makes
//! old entries unreachable without any explicit purge.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::prediction::PredictionRequest;

/// Hex-encoded SHA-256 digest identifying a prediction request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The raw hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cache-store key for the prediction entry
    pub fn entry_key(&self) -> String {
        format!("prediction:{}", self.0)
    }

    /// Cache-store key for the in-flight marker
    pub fn marker_key(&self) -> String {
        format!("inflight:{}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the fingerprint of a request. Pure and deterministic: no I/O,
/// no clock, no randomness.
pub fn fingerprint(request: &PredictionRequest) -> Fingerprint {
    let digest_input = json!({
        "model_name": request.model_name,
        "model_version": request.resolved_version(),
        "input_features": Value::Object(
            request
                .input_features
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
    });

    let canonical = to_canonical_json(&digest_input);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    use std::fmt::Write;
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // writing to a String is infallible
        let _ = write!(hex, "{:02x}", byte);
    }
    Fingerprint(hex)
}

/// Render a JSON value in canonical form: object keys sorted recursively,
/// numbers in serde_json's fixed shortest representation, no whitespace.
fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (key, val) in map {
                sorted.insert(key.clone(), to_canonical_json(val));
            }
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(key, val)| format!("{}:{}", Value::String(key), val))
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}
