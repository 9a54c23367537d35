//! Canonical JSON encoding of event content.
//!
//! Event keys are hashes of this encoding, so the same logical content must
//! always produce the same bytes, no matter how the payload map was built:
//!
//! - Compact: no whitespace between tokens.
//! - Object keys sorted lexicographically at every depth.
//! - Arrays keep element order.

use serde_json::Value;

/// Produce the canonical text of a [`serde_json::Value`].
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use causal_core::event::canonical::canonicalize_json;
///
/// let val = json!({"z": 1, "a": {"c": 3, "b": 2}});
/// assert_eq!(canonicalize_json(&val), r#"{"a":{"b":2,"c":3},"z":1}"#);
/// ```
#[must_use]
pub fn canonicalize_json(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Null => buf.push_str("null"),
        Value::Bool(true) => buf.push_str("true"),
        Value::Bool(false) => buf.push_str("false"),
        Value::Number(n) => buf.push_str(&n.to_string()),
        Value::String(s) => write_string(s, buf),
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            buf.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_string(key, buf);
                buf.push(':');
                write_canonical(val, buf);
            }
            buf.push('}');
        }
    }
}

fn write_string(s: &str, buf: &mut String) {
    buf.push_str(&Value::String(s.to_owned()).to_string());
}
