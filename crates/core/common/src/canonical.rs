//! Canonical JSON (RFC 8785) and content hashing
//!
//! Every content-addressed identifier in the agent (snapshot hash, decision id,
//! order intent id, advisory input hash) is the lowercase-hex SHA-256 of the
//! canonical form produced here. Object keys are ordered by UTF-16 code units,
//! numbers use the ECMAScript shortest round-trip form, and no insignificant
//! whitespace is emitted.

use crate::error::{CommonError, CommonResult};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Canonical JSON text for an already-built JSON value
pub fn canonical_json(value: &Value) -> CommonResult<String> {
    let mut out = String::with_capacity(256);
    write_value(&mut out, value)?;
    Ok(out)
}

/// Canonical JSON text for any serializable value
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> CommonResult<String> {
    let value = serde_json::to_value(value)?;
    canonical_json(&value)
}

/// Lowercase-hex SHA-256 of the canonical JSON of `value`
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> CommonResult<String> {
    let text = to_canonical_json(value)?;
    Ok(sha256_hex(text.as_bytes()))
}

/// Lowercase-hex SHA-256 of raw bytes
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// True for a 64-char lowercase hex digest
#[must_use]
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn write_value(out: &mut String, value: &Value) -> CommonResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map)?,
    }
    Ok(())
}

fn write_object(out: &mut String, map: &Map<String, Value>) -> CommonResult<()> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.encode_utf16().cmp(b.0.encode_utf16()));

    out.push('{');
    for (i, (key, item)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, item)?;
    }
    out.push('}');
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_number(out: &mut String, n: &Number) -> CommonResult<()> {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
        return Ok(());
    }
    let f = n.as_f64().ok_or(CommonError::NonFiniteNumber)?;
    out.push_str(&format_es6(f)?);
    Ok(())
}

/// ECMAScript `Number::toString` for a finite double
pub fn format_es6(value: f64) -> CommonResult<String> {
    if !value.is_finite() {
        return Err(CommonError::NonFiniteNumber);
    }
    if value == 0.0 {
        return Ok("0".to_string());
    }

    // `{:e}` yields the shortest round-trip digits, e.g. "1.2345e-7"
    let sci = format!("{:e}", value.abs());
    let (mantissa, exponent) = sci
        .split_once('e')
        .ok_or_else(|| CommonError::schema("number", sci.clone()))?;
    let exponent: i32 = exponent
        .parse()
        .map_err(|_| CommonError::schema("number", sci.clone()))?;
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = i32::try_from(digits.len()).map_err(|_| CommonError::NonFiniteNumber)?;
    let n = exponent + 1;

    let mut s = String::with_capacity(32);
    if value < 0.0 {
        s.push('-');
    }

    if k <= n && n <= 21 {
        s.push_str(&digits);
        for _ in 0..(n - k) {
            s.push('0');
        }
    } else if 0 < n && n <= 21 {
        let split = n as usize;
        s.push_str(&digits[..split]);
        s.push('.');
        s.push_str(&digits[split..]);
    } else if -6 < n && n <= 0 {
        s.push_str("0.");
        for _ in 0..(-n) {
            s.push('0');
        }
        s.push_str(&digits);
    } else {
        s.push_str(&digits[..1]);
        if k > 1 {
            s.push('.');
            s.push_str(&digits[1..]);
        }
        s.push('e');
        let e = n - 1;
        s.push(if e >= 0 { '+' } else { '-' });
        let _ = write!(s, "{}", e.abs());
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_change_hash() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[1,2],"x":"s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "a" : { "x":"s", "y":[1, 2] }, "b":1 }"#).unwrap();
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
        assert_eq!(canonical_json(&a).unwrap(), r#"{"a":{"x":"s","y":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_keys_sorted_by_utf16_code_units() {
        let v = json!({
            "\u{20ac}": "Euro Sign",
            "\r": "Carriage Return",
            "\u{fb33}": "Hebrew Letter Dalet With Dagesh",
            "1": "One",
            "\u{1f600}": "Emoji: Grinning Face",
            "\u{80}": "Control",
            "\u{f6}": "Latin Small Letter O With Diaeresis"
        });
        let text = canonical_json(&v).unwrap();
        let order: Vec<usize> = ["\\r", "\"1\"", "\u{80}", "\u{f6}", "\u{20ac}", "\u{1f600}", "\u{fb33}"]
            .iter()
            .map(|k| text.find(k).unwrap())
            .collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_es6_number_forms() {
        assert_eq!(format_es6(1e21).unwrap(), "1e+21");
        assert_eq!(format_es6(1e20).unwrap(), "100000000000000000000");
        assert_eq!(format_es6(1e-7).unwrap(), "1e-7");
        assert_eq!(format_es6(0.000001).unwrap(), "0.000001");
        assert_eq!(format_es6(123.456).unwrap(), "123.456");
        assert_eq!(format_es6(-0.5).unwrap(), "-0.5");
        assert_eq!(format_es6(-0.0).unwrap(), "0");
        assert_eq!(format_es6(4.5).unwrap(), "4.5");
        assert_eq!(format_es6(2.0).unwrap(), "2");
        assert!(format_es6(f64::NAN).is_err());
    }

    #[test]
    fn test_string_escaping() {
        let v = json!({"k": "a\"b\\c\n\u{1}\u{7f}é"});
        assert_eq!(canonical_json(&v).unwrap(), "{\"k\":\"a\\\"b\\\\c\\n\\u0001\u{7f}é\"}");
    }

    #[test]
    fn test_canonical_is_fixed_point() {
        let v = json!({"z": [1.5, 2, -0.125, "x"], "a": {"n": null, "t": true}, "m": 1e21});
        let once = canonical_json(&v).unwrap();
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(canonical_json(&reparsed).unwrap(), once);
    }

    #[test]
    fn test_sha256_hex_shape() {
        let h = sha256_hex(b"abc");
        assert_eq!(h, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert!(is_sha256_hex(&h));
        assert!(!is_sha256_hex(&h.to_uppercase()));
    }
}
