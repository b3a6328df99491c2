//! Structured query keys and canonical hashing.
//!
//! A query key is either a plain string or an ordered sequence of strings,
//! numbers, booleans, nulls, and string-keyed maps. Two keys identify the
//! same cache entry iff their canonical hashes are equal; the canonical hash
//! serializes map entries in sorted-key order at every depth, so semantically
//! equal keys with different insertion orders collide.
//!
//! # Example
//!
//! ```
//! use freshet::QueryKey;
//! use serde_json::json;
//!
//! let a = QueryKey::from(json!(["todos", {"page": 1, "done": false}]));
//! let b = QueryKey::from(json!(["todos", {"done": false, "page": 1}]));
//! assert_eq!(a.canonical_hash(), b.canonical_hash());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Value);

impl QueryKey {
    /// Creates a key from a raw JSON value.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The underlying structured value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Canonical string hash of this key.
    ///
    /// Deterministic across platforms: map keys are emitted sorted at every
    /// depth, array order is preserved, primitives serialize as-is.
    #[must_use]
    pub fn canonical_hash(&self) -> String {
        let mut out = String::new();
        write_canonical(&self.0, &mut out);
        out
    }

    /// Normalized element view: a string key behaves as a one-element
    /// sequence for prefix matching.
    fn elements(&self) -> Vec<Value> {
        match &self.0 {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    /// Returns `true` if this key, treated as a filter, matches `candidate`
    /// at an array prefix: every element at index `i` must deep-match the
    /// candidate's element at `i`, where map elements match by deep partial
    /// equality (each filter entry present and equal in the candidate).
    #[must_use]
    pub fn is_prefix_of(&self, candidate: &QueryKey) -> bool {
        let filter = self.elements();
        let target = candidate.elements();
        if filter.len() > target.len() {
            return false;
        }
        filter
            .iter()
            .zip(target.iter())
            .all(|(f, t)| partial_deep_eq(t, f))
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self::new(Value::String(value.to_owned()))
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self::new(Value::String(value))
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(value: Vec<Value>) -> Self {
        Self::new(Value::Array(value))
    }
}

/// Serializes `value` into `out` with map keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        // serde_json escapes and quotes the string for us
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Deep partial equality: every entry of `filter` must be present and
/// partial-equal in `candidate`; primitives compare by value.
pub(crate) fn partial_deep_eq(candidate: &Value, filter: &Value) -> bool {
    match (candidate, filter) {
        (Value::Object(c), Value::Object(f)) => f
            .iter()
            .all(|(key, fv)| c.get(key).is_some_and(|cv| partial_deep_eq(cv, fv))),
        (Value::Array(c), Value::Array(f)) => {
            f.len() <= c.len()
                && f.iter()
                    .zip(c.iter())
                    .all(|(fv, cv)| partial_deep_eq(cv, fv))
        }
        (c, f) => c == f,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_key_hash() {
        let key = QueryKey::from("todos");
        assert_eq!(key.canonical_hash(), "\"todos\"");
    }

    #[test]
    fn test_object_keys_sorted_at_every_depth() {
        let a = QueryKey::from(json!(["todos", {"b": {"y": 2, "x": 1}, "a": 0}]));
        let b = QueryKey::from(json!(["todos", {"a": 0, "b": {"x": 1, "y": 2}}]));
        assert_eq!(a.canonical_hash(), b.canonical_hash());
        assert_eq!(
            a.canonical_hash(),
            "[\"todos\",{\"a\":0,\"b\":{\"x\":1,\"y\":2}}]"
        );
    }

    #[test]
    fn test_array_order_preserved() {
        let a = QueryKey::from(json!(["todos", 1]));
        let b = QueryKey::from(json!([1, "todos"]));
        assert_ne!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn test_hash_distinguishes_structure() {
        // A string key and a one-element array key are different entries,
        // even though prefix matching normalizes them to the same elements.
        let plain = QueryKey::from("todos");
        let wrapped = QueryKey::from(json!(["todos"]));
        assert_ne!(plain.canonical_hash(), wrapped.canonical_hash());
    }

    #[test]
    fn test_prefix_match_on_arrays() {
        let filter = QueryKey::from(json!(["todos"]));
        let candidate = QueryKey::from(json!(["todos", {"page": 2}]));
        assert!(filter.is_prefix_of(&candidate));
        assert!(!candidate.is_prefix_of(&filter));
    }

    #[test]
    fn test_prefix_match_partial_objects() {
        let filter = QueryKey::from(json!(["todos", {"done": true}]));
        let candidate = QueryKey::from(json!(["todos", {"done": true, "page": 3}]));
        let other = QueryKey::from(json!(["todos", {"done": false, "page": 3}]));
        assert!(filter.is_prefix_of(&candidate));
        assert!(!filter.is_prefix_of(&other));
    }

    #[test]
    fn test_string_filter_matches_array_candidate() {
        let filter = QueryKey::from("todos");
        let candidate = QueryKey::from(json!(["todos", 1]));
        assert!(filter.is_prefix_of(&candidate));
    }

    #[test]
    fn test_exact_match_via_hash() {
        let a = QueryKey::from(json!([null, false, 1.5]));
        let b = QueryKey::from(json!([null, false, 1.5]));
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }
}
