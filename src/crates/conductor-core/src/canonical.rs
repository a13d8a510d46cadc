//! Canonical JSON and step fingerprinting
//!
//! Cache keys must be stable across processes: two executions of the same
//! step with the same resolved input must land on the same cache entry no
//! matter which process computed it. That requires a canonical byte
//! representation of JSON values before hashing:
//!
//! - object keys are emitted in sorted order,
//! - floats with no fractional part are normalized to integers
//!   (`1.0` and `1` fingerprint identically),
//! - arrays keep their order (order is semantic).
//!
//! Canonicalization is idempotent: `canonicalize(canonicalize(x)) ==
//! canonicalize(x)`.
//!
//! The fingerprint itself is the hex SHA-256 digest of
//! `memberName \n memberVersion \n canonical(input) \n canonical(config)`,
//! which comfortably exceeds the required 64-bit key width.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Rebuild a value in canonical form: sorted object keys, integral floats
/// collapsed to integers.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => Value::Number(normalize_number(n)),
        other => other.clone(),
    }
}

/// Serialize a value canonically. Keys come out sorted because
/// [`canonicalize`] rebuilds maps in sorted insertion order.
pub fn canonical_string(value: &Value) -> String {
    // Canonical values only contain maps built in sorted order, and
    // serde_json emits map entries in insertion order.
    canonicalize(value).to_string()
}

fn normalize_number(n: &Number) -> Number {
    if let Some(f) = n.as_f64() {
        if n.as_i64().is_none() && n.as_u64().is_none() {
            // A true float: collapse to integer when integral and exactly
            // representable.
            if f.fract() == 0.0 && f.is_finite() && f.abs() < (i64::MAX as f64) {
                return Number::from(f as i64);
            }
        }
    }
    n.clone()
}

/// Stable fingerprint of a step invocation, used as its cache key.
pub fn fingerprint(
    member_name: &str,
    member_version: &str,
    resolved_input: &Value,
    config: &Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(member_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(member_version.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_string(resolved_input).as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_string(config).as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_keys_are_sorted() {
        let a = json!({"zebra": 1, "apple": 2, "mango": {"y": 1, "x": 2}});
        assert_eq!(
            canonical_string(&a),
            r#"{"apple":2,"mango":{"x":2,"y":1},"zebra":1}"#
        );
    }

    #[test]
    fn test_integral_float_normalization() {
        assert_eq!(canonical_string(&json!(1.0)), "1");
        assert_eq!(canonical_string(&json!(1)), "1");
        assert_eq!(canonical_string(&json!(-3.0)), "-3");
        // Non-integral floats stay floats
        assert_eq!(canonical_string(&json!(1.5)), "1.5");
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let v = json!({"b": [3.0, {"d": 1, "c": 2.5}], "a": null});
        let once = canonicalize(&v);
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_array_order_is_semantic() {
        assert_ne!(
            canonical_string(&json!([1, 2])),
            canonical_string(&json!([2, 1]))
        );
    }

    #[test]
    fn test_fingerprint_equality() {
        let a = fingerprint("upper", "1.0.0", &json!({"text": "hi", "n": 2.0}), &json!({}));
        let b = fingerprint("upper", "1.0.0", &json!({"n": 2, "text": "hi"}), &json!({}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let base = fingerprint("upper", "1.0.0", &json!({"text": "hi"}), &json!({}));
        assert_ne!(
            base,
            fingerprint("upper", "1.0.1", &json!({"text": "hi"}), &json!({}))
        );
        assert_ne!(
            base,
            fingerprint("upper", "1.0.0", &json!({"text": "ho"}), &json!({}))
        );
        assert_ne!(
            base,
            fingerprint("lower", "1.0.0", &json!({"text": "hi"}), &json!({}))
        );
        assert_ne!(
            base,
            fingerprint("upper", "1.0.0", &json!({"text": "hi"}), &json!({"k": 1}))
        );
    }

    #[test]
    fn test_member_separator_is_unambiguous() {
        // name/version boundaries must not collide
        let a = fingerprint("ab", "c", &json!(null), &json!(null));
        let b = fingerprint("a", "bc", &json!(null), &json!(null));
        assert_ne!(a, b);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_json() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(|n| json!(n)),
                (-1e12f64..1e12)
                    .prop_filter("finite", |f| f.is_finite())
                    .prop_map(|f| json!(f)),
                "[a-z0-9 ]{0,12}".prop_map(Value::String),
            ];
            leaf.prop_recursive(4, 64, 6, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                    prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                ]
            })
        }

        proptest! {
            #[test]
            fn canonicalize_is_idempotent(value in arb_json()) {
                let once = canonicalize(&value);
                prop_assert_eq!(canonicalize(&once), once.clone());
            }

            #[test]
            fn fingerprints_are_deterministic(value in arb_json()) {
                let a = fingerprint("member", "1.0.0", &value, &Value::Null);
                let b = fingerprint("member", "1.0.0", &value, &Value::Null);
                prop_assert_eq!(a, b);
            }

            #[test]
            fn canonical_string_is_stable_under_key_shuffle(value in arb_json()) {
                // Re-parsing the canonical form and canonicalizing again
                // lands on the same bytes.
                let canonical = canonical_string(&value);
                let reparsed: Value = serde_json::from_str(&canonical).unwrap();
                prop_assert_eq!(canonical_string(&reparsed), canonical);
            }
        }
    }
}
