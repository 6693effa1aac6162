//! Reconciliation loop primitives.
//!
//! This library provides the pieces a reconcile loop is built from:
//!
//! - **[`WorkQueue`]**: a set-keyed queue. Enqueue is idempotent, dequeue
//!   marks the key in flight, and re-adds during processing are deferred.
//! - **[`BackoffPolicy`]**: jittered exponential backoff for failed keys.
//! - **[`SpecHash`]**: a stable fingerprint of a JSON-serializable spec.
//!
//! # Invariants
//!
//! - A key is pending in a queue at most once
//! - A key is never handed to two workers at the same time
//! - Fingerprints are independent of map key order

mod backoff;
mod queue;

pub use backoff::BackoffPolicy;
pub use queue::WorkQueue;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Used to detect when the fields of a workload that a provider cares about
/// have changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Compute a spec hash of any serializable value.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sorted keys, no whitespace. Strings and numbers reuse serde_json's
/// escaping so the output is valid JSON.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        scalar => scalar.to_string(),
    }
}
