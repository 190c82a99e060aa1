//! Redaction of JSON bound for audit storage
//!
//! Applied to advisory-gate requests and responses, cancel-replace payloads
//! and error details before they are persisted.

use crate::error::RedactionError;
use common::canonical::canonical_json;
use common::config::RedactionConfig;
use serde_json::{Map, Value};

/// Compiled redaction policy; all matching is on lowercase text
#[derive(Debug, Clone)]
pub struct RedactionPolicy {
    remove_keys: Vec<String>,
    reject_substrings: Vec<String>,
    volatile_keys: Vec<String>,
    max_bytes: usize,
}

impl From<&RedactionConfig> for RedactionPolicy {
    fn from(cfg: &RedactionConfig) -> Self {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect();
        Self {
            remove_keys: lower(&cfg.remove_keys),
            reject_substrings: lower(&cfg.reject_substrings),
            volatile_keys: lower(&cfg.volatile_keys),
            max_bytes: cfg.max_bytes,
        }
    }
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self::from(&RedactionConfig::default())
    }
}

impl RedactionPolicy {
    /// Drop remove-listed keys and refuse anything that looks like a secret
    ///
    /// # Errors
    ///
    /// Returns an error if a key or string value contains a reject substring.
    pub fn redact(&self, value: &Value) -> Result<Value, RedactionError> {
        self.redact_inner("", value)
    }

    fn redact_inner(&self, key: &str, value: &Value) -> Result<Value, RedactionError> {
        match value {
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    let lk = k.to_lowercase();
                    if self.remove_keys.iter().any(|r| *r == lk) {
                        continue;
                    }
                    if let Some(needle) = self.reject_substrings.iter().find(|n| lk.contains(n.as_str())) {
                        return Err(RedactionError::ForbiddenKey {
                            key: k.clone(),
                            needle: needle.clone(),
                        });
                    }
                    out.insert(k.clone(), self.redact_inner(k, v)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.redact_inner(key, v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::String(s) => {
                let ls = s.to_lowercase();
                if let Some(needle) = self.reject_substrings.iter().find(|n| ls.contains(n.as_str())) {
                    return Err(RedactionError::ForbiddenValue {
                        key: key.to_string(),
                        needle: needle.clone(),
                    });
                }
                Ok(value.clone())
            }
            _ => Ok(value.clone()),
        }
    }

    /// Redact, canonicalize and enforce the byte budget
    ///
    /// # Errors
    ///
    /// Returns an error if redaction refuses the value.
    pub fn redact_to_string(&self, value: &Value) -> Result<String, RedactionError> {
        let redacted = self.redact(value)?;
        let text = canonical_json(&redacted).map_err(|e| RedactionError::Canonical(e.to_string()))?;
        Ok(self.truncate(text))
    }

    /// Redact free text such as an error detail
    ///
    /// # Errors
    ///
    /// Returns an error if the text contains a reject substring.
    pub fn redact_text(&self, text: &str) -> Result<String, RedactionError> {
        self.redact_inner("detail", &Value::String(text.to_string()))?;
        Ok(self.truncate(text.to_string()))
    }

    fn truncate(&self, text: String) -> String {
        if text.len() > self.max_bytes {
            format!("<TRUNCATED len_bytes={}>", text.len())
        } else {
            text
        }
    }

    /// Remove volatile keys (timestamps, nonces) at every depth
    #[must_use]
    pub fn strip_volatile(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !self.volatile_keys.contains(&k.to_lowercase()))
                    .map(|(k, v)| (k.clone(), self.strip_volatile(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.strip_volatile(v)).collect()),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remove_keys_case_insensitive() {
        let p = RedactionPolicy::default();
        let out = p
            .redact(&json!({"Authorization": "x", "nested": {"API_KEY": "k", "keep": 1}}))
            .unwrap();
        assert_eq!(out, json!({"nested": {"keep": 1}}));
    }

    #[test]
    fn test_reject_substring_in_key_aborts() {
        let p = RedactionPolicy::default();
        let err = p.redact(&json!({"my_private_key_pem": "x"})).unwrap_err();
        assert!(matches!(err, RedactionError::ForbiddenKey { .. }));
    }

    #[test]
    fn test_reject_substring_in_value_aborts() {
        let p = RedactionPolicy::default();
        let err = p.redact(&json!({"header": ["Bearer abc"]})).unwrap_err();
        assert!(matches!(err, RedactionError::ForbiddenValue { ref key, .. } if key == "header"));
    }

    #[test]
    fn test_oversized_payload_truncated() {
        let cfg = RedactionConfig {
            max_bytes: 64,
            ..RedactionConfig::default()
        };
        let p = RedactionPolicy::from(&cfg);
        let big = json!({"blob": "y".repeat(200)});
        let out = p.redact_to_string(&big).unwrap();
        assert_eq!(out, "<TRUNCATED len_bytes=211>");
        assert_eq!(p.redact_to_string(&json!({"b": 1, "a": 2})).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_strip_volatile_keys() {
        let p = RedactionPolicy::default();
        let out = p.strip_volatile(&json!({"ts_ms": 1, "x": [{"nonce": "n", "y": 2}]}));
        assert_eq!(out, json!({"x": [{"y": 2}]}));
    }
}
