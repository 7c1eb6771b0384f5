//! Deterministic cache keys for operation calls.
//!
//! A key is the operation name followed by a blake3 digest of the canonical
//! MessagePack encoding of `(operation, args, kwargs)`. Control kwargs that
//! only steer execution (`priority`, `use_cache`) are left out, so a call made
//! at high priority hits the entry written by the same call at low priority.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{Kwargs, Value};

/// Kwargs that never participate in the cache key.
pub const CONTROL_KWARGS: [&str; 2] = ["priority", "use_cache"];

/// Stable fingerprint of an operation call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for `operation(args, kwargs)`.
    ///
    /// Kwargs are already sorted by name (`BTreeMap`), so the encoding is
    /// independent of the order the caller supplied them in.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the arguments cannot be encoded.
    pub fn for_call(operation: &str, args: &[Value], kwargs: &Kwargs) -> Result<Self, StoreError> {
        let filtered: Vec<(&String, &Value)> = kwargs
            .iter()
            .filter(|(name, _)| !CONTROL_KWARGS.contains(&name.as_str()))
            .collect();
        let encoded = rmp_serde::to_vec(&(operation, args, filtered))?;
        let digest = blake3::hash(&encoded);
        Ok(Self(format!("{operation}:{}", hex::encode(digest.as_bytes()))))
    }

    /// The key as stored in the cache backend.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The operation prefix of the key.
    #[must_use]
    pub fn operation(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(op, _)| op)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kwargs(pairs: &[(&str, Value)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn key_has_operation_prefix_and_hex_digest() {
        let key = CacheKey::for_call("ItemLookup", &[Value::from("B00X")], &Kwargs::new()).unwrap();
        let (op, digest) = key.as_str().split_once(':').unwrap();
        assert_eq!(op, "ItemLookup");
        assert_eq!(key.operation(), "ItemLookup");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn control_kwargs_are_ignored() {
        let plain = kwargs(&[("marketplace", Value::from("US"))]);
        let steered = kwargs(&[
            ("marketplace", Value::from("US")),
            ("priority", Value::Int(2)),
            ("use_cache", Value::Bool(false)),
        ]);
        let a = CacheKey::for_call("GetReport", &[], &plain).unwrap();
        let b = CacheKey::for_call("GetReport", &[], &steered).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_arguments_produce_different_keys() {
        let a = CacheKey::for_call("ItemLookup", &[Value::from("A")], &Kwargs::new()).unwrap();
        let b = CacheKey::for_call("ItemLookup", &[Value::from("B")], &Kwargs::new()).unwrap();
        let c = CacheKey::for_call("ItemSearch", &[Value::from("A")], &Kwargs::new()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn argument_position_matters() {
        let a = CacheKey::for_call(
            "GetMyFeesEstimate",
            &[Value::from("X"), Value::Float(9.5)],
            &Kwargs::new(),
        )
        .unwrap();
        let b = CacheKey::for_call(
            "GetMyFeesEstimate",
            &[Value::Float(9.5), Value::from("X")],
            &Kwargs::new(),
        )
        .unwrap();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn key_is_deterministic(op in "[A-Za-z]{1,20}", arg in ".*", n in any::<i64>()) {
            let kw = kwargs(&[("n", Value::Int(n))]);
            let a = CacheKey::for_call(&op, &[Value::from(arg.clone())], &kw).unwrap();
            let b = CacheKey::for_call(&op, &[Value::from(arg)], &kw).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
