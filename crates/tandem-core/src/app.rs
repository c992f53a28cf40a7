//! Application state encoding
//!
//! An app channel stores its state as an opaque encoding plus a hash of that
//! encoding. The encoding is canonical JSON (object keys sorted at every
//! depth, no whitespace) rendered as `0x`-prefixed hex; the hash is blake3
//! over the encoded bytes. Both peers therefore derive identical
//! `encoded_state`/`state_hash` values from equal states.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::errors::TandemError;
use crate::identifiers::{from_prefixed_hex, to_prefixed_hex, Digest};

/// Off-chain application state carried by install/update requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppState(Value);

impl AppState {
    /// Wrap a JSON value
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the JSON value
    pub fn value(&self) -> &Value {
        &self.0
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        canonical(&self.0).to_string().into_bytes()
    }

    /// Canonical encoding of this state
    pub fn encode(&self) -> String {
        to_prefixed_hex(&self.canonical_bytes())
    }

    /// Hash of the canonical encoding
    pub fn state_hash(&self) -> String {
        Digest::of(&self.canonical_bytes()).to_string()
    }

    /// Decode a previously encoded state
    pub fn decode(encoded: &str) -> Result<Self, TandemError> {
        let bytes = from_prefixed_hex(encoded)?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(Self(value))
    }
}

/// Copy of `value` with every object's keys inserted in sorted order
///
/// Holds whether or not `serde_json` keeps insertion order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let sorted: BTreeMap<&String, Value> = object
                .iter()
                .map(|(key, field)| (key, canonical(field)))
                .collect();
            let mut out = Map::new();
            for (key, field) in sorted {
                out.insert(key.clone(), field);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Recompute the state hash of an encoded state
pub fn hash_encoded_state(encoded: &str) -> Result<String, TandemError> {
    let bytes = from_prefixed_hex(encoded)?;
    Ok(Digest::of(&bytes).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encoding_ignores_key_order() {
        let a = AppState::new(json!({"alice": "0x1", "aliceBalance": "10"}));
        let b: AppState = serde_json::from_str(r#"{"aliceBalance":"10","alice":"0x1"}"#).unwrap();

        assert_eq!(a.encode(), b.encode());
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_nested_keys_are_sorted() {
        let mut inner = Map::new();
        inner.insert("z".to_string(), json!(1));
        inner.insert("m".to_string(), json!([{"y": 2, "x": 3}]));
        let mut outer = Map::new();
        outer.insert("peers".to_string(), Value::Object(inner));
        outer.insert("nonce".to_string(), json!(7));
        let state = AppState::new(Value::Object(outer));

        let bytes = from_prefixed_hex(&state.encode()).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"nonce":7,"peers":{"m":[{"x":3,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_hash_is_function_of_encoding() {
        let state = AppState::new(json!({"aliceBalance": 5, "bobBalance": 15}));
        let encoded = state.encode();

        assert_eq!(hash_encoded_state(&encoded).unwrap(), state.state_hash());
        assert_eq!(AppState::decode(&encoded).unwrap(), state);
    }

    #[test]
    fn test_different_states_hash_differently() {
        let a = AppState::new(json!({"aliceBalance": 5}));
        let b = AppState::new(json!({"aliceBalance": 6}));
        assert_ne!(a.state_hash(), b.state_hash());
    }
}
