// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Byte-deterministic JSON canonicalization for signing and hashing."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Canonical serialization of JSON-like payloads.
//!
//! Two entry points:
//! - [`canonicalize`] — generic form with caller-selected top-level key
//!   stripping, used by the portal-compat verification path.
//! - [`canonicalize_jobspec_v1`] — the JobSpec signing form, which strips
//!   `signature` and `public_key`.
//!
//! Object keys are sorted lexicographically, integers render without a
//! decimal point, floats render in shortest round-trip form, and strings use
//! the minimal escape set of RFC 8785 JCS. The same semantic content
//! produces identical bytes regardless of input key order or whitespace.

use beacon_core::JobSpec;
use serde_json::Value;

/// Errors from canonical serialization.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// The typed value could not be converted to a JSON tree.
    #[error("canonicalization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Keys excluded from the JobSpec signing form.
pub const JOBSPEC_SIGNING_STRIP: &[&str] = &["signature", "public_key"];

/// Keys excluded on the portal-compat fallback path, which additionally
/// ignores a server-assigned `id`.
pub const PORTAL_COMPAT_STRIP: &[&str] = &["signature", "public_key", "id"];

/// Produce canonical bytes for `value`, dropping the named top-level keys.
pub fn canonicalize(value: &Value, strip_keys: &[&str]) -> Vec<u8> {
    let mut out = String::new();
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map
                .iter()
                .filter(|(k, _)| !strip_keys.contains(&k.as_str()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            write_object(&entries, &mut out);
        }
        other => write_value(other, &mut out),
    }
    out.into_bytes()
}

/// Canonical signing form of a JobSpec: the spec as a JSON tree with
/// `signature` and `public_key` removed.
pub fn canonicalize_jobspec_v1(spec: &JobSpec) -> Result<Vec<u8>, CanonicalError> {
    let value = serde_json::to_value(spec)?;
    Ok(canonicalize(&value, JOBSPEC_SIGNING_STRIP))
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            write_object(&entries, out);
        }
    }
}

fn write_object(entries: &[(&String, &Value)], out: &mut String) {
    out.push('{');
    for (i, (key, val)) in entries.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(val, out);
    }
    out.push('}');
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        // Rust's f64 Display is the shortest representation that round-trips.
        out.push_str(&f.to_string());
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon_str(v: &Value) -> String {
        String::from_utf8(canonicalize(v, &[])).unwrap()
    }

    #[test]
    fn keys_are_sorted() {
        let v = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        assert_eq!(canon_str(&v), r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn key_order_in_source_is_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2], "z": "s"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "z":"s", "x":1, "y":[1,2] }"#).unwrap();
        assert_eq!(canonicalize(&a, &[]), canonicalize(&b, &[]));
    }

    #[test]
    fn integers_without_decimal_point() {
        assert_eq!(canon_str(&json!(42)), "42");
        assert_eq!(canon_str(&json!(-7)), "-7");
        assert_eq!(canon_str(&json!(0)), "0");
        assert_eq!(canon_str(&json!(u64::MAX)), u64::MAX.to_string());
    }

    #[test]
    fn floats_shortest_roundtrip() {
        assert_eq!(canon_str(&json!(1.5)), "1.5");
        assert_eq!(canon_str(&json!(0.1)), "0.1");
    }

    #[test]
    fn minimal_string_escapes() {
        assert_eq!(
            canon_str(&json!("a\"b\\c\nd\te\u{0001}")),
            r#""a\"b\\c\nd\te\u0001""#
        );
        // Non-ASCII passes through unescaped.
        assert_eq!(canon_str(&json!("héllo")), "\"héllo\"");
    }

    #[test]
    fn strip_keys_only_affects_top_level() {
        let v = json!({"signature": "s", "nested": {"signature": "keep"}});
        let out = String::from_utf8(canonicalize(&v, &["signature"])).unwrap();
        assert_eq!(out, r#"{"nested":{"signature":"keep"}}"#);
    }

    #[test]
    fn portal_compat_strips_id() {
        let v = json!({"id": "x", "signature": "s", "public_key": "p", "version": "v1"});
        let out = String::from_utf8(canonicalize(&v, PORTAL_COMPAT_STRIP)).unwrap();
        assert_eq!(out, r#"{"version":"v1"}"#);
    }

    #[test]
    fn roundtrip_parse_of_canonical_form_is_stable() {
        let v = json!({
            "metadata": {"nonce": "n-1", "timestamp": "2025-06-01T00:00:00Z"},
            "constraints": {"regions": ["US", "EU"], "min_regions": 2},
            "score": 0.67
        });
        let first = canon_str(&v);
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(canon_str(&reparsed), first);
        assert_eq!(reparsed, v);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|i| Value::from(i)),
            "[a-zA-Z0-9 _\\n\"\\\\]{0,16}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonicalize_is_idempotent(v in arb_json()) {
            let once = canonicalize(&v, &[]);
            let reparsed: Value = serde_json::from_slice(&once).unwrap();
            let twice = canonicalize(&reparsed, &[]);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn canonical_form_parses_back_to_same_value(v in arb_json()) {
            let bytes = canonicalize(&v, &[]);
            let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(reparsed, v);
        }
    }
}
