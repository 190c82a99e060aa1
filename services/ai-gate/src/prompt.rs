//! Prompt assets: system message and result schema
//!
//! Loaded from `aigate.prompt_dir` when configured, otherwise the copies
//! compiled into the binary are used.

use crate::error::{AiGateError, GateResult};
use serde_json::Value;
use std::path::Path;

/// File holding the system message
pub const SYSTEM_FILE: &str = "system.txt";
/// File holding the JSON schema of the result
pub const SCHEMA_FILE: &str = "schema.json";
/// `response_format.json_schema.name`
pub const SCHEMA_NAME: &str = "ai_gate_result";

const BUILTIN_SYSTEM: &str = include_str!("../prompts/system.txt");
const BUILTIN_SCHEMA: &str = include_str!("../prompts/schema.json");

/// System prompt plus strict response schema
#[derive(Debug, Clone, PartialEq)]
pub struct PromptAssets {
    /// System message
    pub system: String,
    /// JSON schema the answer must satisfy
    pub schema: Value,
}

impl PromptAssets {
    /// Compiled-in assets
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded schema is malformed.
    pub fn builtin() -> GateResult<Self> {
        Self::parse(BUILTIN_SYSTEM, BUILTIN_SCHEMA)
    }

    /// Assets from `dir`, or the built-ins when `dir` is `None`
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing or the schema does not declare
    /// the result fields.
    pub fn load(dir: Option<&Path>) -> GateResult<Self> {
        let Some(dir) = dir else {
            return Self::builtin();
        };
        let read = |name: &str| {
            std::fs::read_to_string(dir.join(name))
                .map_err(|e| AiGateError::Prompt(format!("{}: {e}", dir.join(name).display())))
        };
        Self::parse(&read(SYSTEM_FILE)?, &read(SCHEMA_FILE)?)
    }

    fn parse(system: &str, schema: &str) -> GateResult<Self> {
        if system.trim().is_empty() {
            return Err(AiGateError::Prompt(format!("{SYSTEM_FILE} is empty")));
        }
        let schema: Value =
            serde_json::from_str(schema).map_err(|e| AiGateError::Prompt(format!("{SCHEMA_FILE}: {e}")))?;
        let props = schema
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| AiGateError::Prompt(format!("{SCHEMA_FILE}: no properties")))?;
        for field in ["verdict", "reasons", "modified_decision"] {
            if !props.contains_key(field) {
                return Err(AiGateError::Prompt(format!("{SCHEMA_FILE}: missing property {field}")));
            }
        }
        Ok(Self {
            system: system.to_string(),
            schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builtin_assets_parse() {
        let a = PromptAssets::builtin().unwrap();
        assert!(a.system.contains("ai_gate_result"));
        assert_eq!(a.schema["additionalProperties"], Value::Bool(false));
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SYSTEM_FILE), "review").unwrap();
        std::fs::write(
            dir.path().join(SCHEMA_FILE),
            r#"{"properties":{"verdict":{},"reasons":{},"modified_decision":{}}}"#,
        )
        .unwrap();
        let a = PromptAssets::load(Some(dir.path())).unwrap();
        assert_eq!(a.system, "review");
    }

    #[test]
    fn test_schema_without_reasons_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SYSTEM_FILE), "review").unwrap();
        std::fs::write(dir.path().join(SCHEMA_FILE), r#"{"properties":{"verdict":{}}}"#).unwrap();
        let err = PromptAssets::load(Some(dir.path())).unwrap_err();
        assert!(err.to_string().contains("reasons"));
    }

    #[test]
    fn test_missing_dir_is_prompt_error() {
        let dir = tempdir().unwrap();
        let err = PromptAssets::load(Some(&dir.path().join("absent"))).unwrap_err();
        assert!(matches!(err, AiGateError::Prompt(_)));
    }
}
