//! Structural normalization of payloads before they reach the document store.
//!
//! The store holds signed 64-bit integers at most. Any integer outside
//! `[i64::MIN, i64::MAX]` is rewritten as its base-10 string; every other
//! value is left as is. Mappings keep their keys and sequences keep their
//! order. The transform is pure and idempotent.

use serde_json::{Number, Value};

/// Returns a copy of `value` in which every out-of-range integer has been
/// replaced by its decimal string.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Number(n) => sanitize_number(n),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| (key.clone(), sanitize(val)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// In-place variant of [`sanitize`] for payloads the caller already owns.
pub fn sanitize_in_place(value: &mut Value) {
    match value {
        Value::Number(n) => {
            if let Some(text) = oversized_integer(n) {
                *value = Value::String(text);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_in_place),
        Value::Object(map) => map.values_mut().for_each(sanitize_in_place),
        _ => {}
    }
}

/// True when every integer inside `value` fits in an `i64`.
pub fn is_sanitized(value: &Value) -> bool {
    match value {
        Value::Number(n) => oversized_integer(n).is_none(),
        Value::Array(items) => items.iter().all(is_sanitized),
        Value::Object(map) => map.values().all(is_sanitized),
        _ => true,
    }
}

fn sanitize_number(n: &Number) -> Value {
    match oversized_integer(n) {
        Some(text) => Value::String(text),
        None => Value::Number(n.clone()),
    }
}

fn oversized_integer(n: &Number) -> Option<String> {
    if n.as_i64().is_some() {
        return None;
    }
    let text = n.to_string();
    let digits = text.strip_prefix('-').unwrap_or(&text);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(text)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn in_range_integers_are_kept() {
        assert_eq!(sanitize(&json!(i64::MAX)), json!(i64::MAX));
        assert_eq!(sanitize(&json!(i64::MIN)), json!(i64::MIN));
        assert_eq!(sanitize(&json!(0)), json!(0));
    }

    #[test]
    fn integers_just_outside_range_become_strings() {
        assert_eq!(
            sanitize(&parse("9223372036854775808")),
            json!("9223372036854775808")
        );
        assert_eq!(
            sanitize(&parse("-9223372036854775809")),
            json!("-9223372036854775809")
        );
        assert_eq!(sanitize(&json!(u64::MAX)), json!("18446744073709551615"));
    }

    #[test]
    fn nested_structures_are_walked() {
        let input = parse(r#"{"a": [18446744073709551616, "x"], "b": {"c": 1}}"#);
        assert_eq!(
            sanitize(&input),
            json!({"a": ["18446744073709551616", "x"], "b": {"c": 1}})
        );
    }

    #[test]
    fn floats_and_other_scalars_are_untouched() {
        let input = parse(r#"[1.5, 1e300, true, null, "123456789012345678901234"]"#);
        assert_eq!(sanitize(&input), input);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let input = parse(
            r#"{"big": 123456789012345678901234567890, "list": [[-99999999999999999999]], "ok": 7}"#,
        );
        let once = sanitize(&input);
        assert_eq!(sanitize(&once), once);
        assert!(is_sanitized(&once));
        assert!(!is_sanitized(&input));
    }

    #[test]
    fn key_order_is_preserved() {
        let input = parse(r#"{"z": 1, "a": 99999999999999999999, "m": 3}"#);
        let keys: Vec<_> = sanitize(&input)
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn in_place_matches_copying_variant() {
        let input = parse(r#"{"a": [18446744073709551616, {"b": -18446744073709551616}]}"#);
        let mut owned = input.clone();
        sanitize_in_place(&mut owned);
        assert_eq!(owned, sanitize(&input));
    }
}
