//! Envelope canonicalization and keyed hashing.
//!
//! The hash is an HMAC-SHA-256 digest over a canonical rendering of the
//! envelope with the `hash` field removed. Canonical form is compact JSON
//! with object keys in lexicographic order at every level, so both ends of
//! a queue agree on the bytes regardless of field ordering.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{ErrorCode, ExchangeError, ExchangeResult};

type HmacSha256 = Hmac<Sha256>;

/// Field stripped from the envelope before hashing.
const HASH_FIELD: &str = "hash";

/// Render a JSON value in canonical form.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(_) => out.push_str(&value.to_string()),
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

/// Compute the keyed hash of an envelope, ignoring any `hash` field it
/// already carries.
pub fn create_message_hash(envelope: &Value, key: &str) -> ExchangeResult<String> {
    let mut mac = keyed_mac(key)?;
    mac.update(hash_input(envelope).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify the `hash` field of an envelope against its canonical form.
///
/// A missing, malformed or mismatched hash is message tampering.
pub fn verify_message_hash(envelope: &Value, key: &str) -> ExchangeResult<()> {
    let carried = envelope
        .get(HASH_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| tampering("envelope carries no hash"))?;
    let digest = hex::decode(carried).map_err(|_| tampering("envelope hash is not hex"))?;

    let mut mac = keyed_mac(key)?;
    mac.update(hash_input(envelope).as_bytes());
    mac.verify_slice(&digest)
        .map_err(|_| tampering("envelope hash does not match its content"))
}

fn hash_input(envelope: &Value) -> String {
    match envelope {
        Value::Object(map) if map.contains_key(HASH_FIELD) => {
            let mut stripped = map.clone();
            stripped.remove(HASH_FIELD);
            canonicalize(&Value::Object(stripped))
        }
        other => canonicalize(other),
    }
}

fn keyed_mac(key: &str) -> ExchangeResult<HmacSha256> {
    HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| ExchangeError::general("invalid message hash key").with_source(e))
}

fn tampering(message: &str) -> ExchangeError {
    ExchangeError::new(ErrorCode::MessageTamperingDetected, message)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const KEY: &str = "test-hash-key";

    #[test]
    fn test_canonical_form_orders_keys() {
        let value = json!({"b": 1, "a": {"d": 2, "c": [3, {"f": 4, "e": 5}]}});
        assert_eq!(
            canonicalize(&value),
            r#"{"a":{"c":[3,{"e":5,"f":4}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_form_escapes_strings() {
        let value = json!({"msg": "line\nbreak \"quoted\""});
        assert_eq!(canonicalize(&value), r#"{"msg":"line\nbreak \"quoted\""}"#);
    }

    #[test]
    fn test_key_order_does_not_change_hash() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(
            create_message_hash(&a, KEY).unwrap(),
            create_message_hash(&b, KEY).unwrap()
        );
    }

    #[test]
    fn test_hash_field_is_excluded_from_input() {
        let without = json!({"messageId": "m-1", "payload": "store:1"});
        let mut with = without.clone();
        with["hash"] = json!(create_message_hash(&without, KEY).unwrap());
        assert_eq!(
            create_message_hash(&with, KEY).unwrap(),
            create_message_hash(&without, KEY).unwrap()
        );
    }

    #[test]
    fn test_verify_round_trip() {
        let mut envelope = json!({"messageId": "m-1", "payload": "store:1"});
        let digest = create_message_hash(&envelope, KEY).unwrap();
        envelope["hash"] = json!(digest);
        assert!(verify_message_hash(&envelope, KEY).is_ok());
    }

    #[test]
    fn test_verify_rejects_mutation() {
        let mut envelope = json!({"messageId": "m-1", "payload": "store:1"});
        envelope["hash"] = json!(create_message_hash(&envelope, KEY).unwrap());
        envelope["payload"] = json!("store:2");

        let err = verify_message_hash(&envelope, KEY).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTamperingDetected);
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let mut envelope = json!({"messageId": "m-1"});
        envelope["hash"] = json!(create_message_hash(&envelope, KEY).unwrap());
        assert!(verify_message_hash(&envelope, "other-key").is_err());
    }

    #[test]
    fn test_verify_rejects_missing_hash() {
        let envelope = json!({"messageId": "m-1"});
        let err = verify_message_hash(&envelope, KEY).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTamperingDetected);
    }
}
