//! Strict parsing of the model answer

use crate::error::{AiGateError, GateResult};
use common::ReasonCode;
use common::model::decision::{AiVerdict, Decision};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireResult {
    verdict: String,
    reasons: Vec<String>,
    #[serde(default)]
    modified_decision: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Validated model answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReply {
    /// ALLOW, BLOCK or MODIFY
    pub verdict: AiVerdict,
    /// Registered reason codes, non-empty
    pub reasons: Vec<ReasonCode>,
    /// Present iff the verdict is MODIFY
    pub modified_decision: Option<Decision>,
}

/// First choice's message content of a chat-completions body
///
/// # Errors
///
/// Returns a parse error if the body is not a completion or has no content.
pub fn message_content(body: &str) -> GateResult<String> {
    let completion: ChatCompletion =
        serde_json::from_str(body).map_err(|e| AiGateError::Parse(format!("completion body: {e}")))?;
    completion
        .choices
        .into_iter()
        .find_map(|c| c.message.content)
        .ok_or_else(|| AiGateError::Parse("no choice with message content".into()))
}

/// Parse and validate the result object
///
/// # Errors
///
/// - `Parse` if `content` is not JSON
/// - `UnknownReason` for a code outside the registry
/// - `Schema` for any other shape violation
pub fn parse_reply(content: &str) -> GateResult<GateReply> {
    let value: Value = serde_json::from_str(content.trim()).map_err(|e| AiGateError::Parse(e.to_string()))?;
    let wire: WireResult = serde_json::from_value(value).map_err(|e| AiGateError::Schema(e.to_string()))?;

    let verdict = match AiVerdict::from_str(&wire.verdict) {
        Ok(v @ (AiVerdict::Allow | AiVerdict::Block | AiVerdict::Modify)) => v,
        _ => return Err(AiGateError::Schema(format!("verdict {:?} not allowed", wire.verdict))),
    };

    if wire.reasons.is_empty() {
        return Err(AiGateError::Schema("reasons must not be empty".into()));
    }
    let reasons = wire
        .reasons
        .iter()
        .map(|r| ReasonCode::from_str(r).map_err(|_| AiGateError::UnknownReason(r.clone())))
        .collect::<GateResult<Vec<_>>>()?;

    let modified = wire.modified_decision.filter(|v| !v.is_null());
    let modified_decision = match (verdict, modified) {
        (AiVerdict::Modify, Some(v)) => Some(
            serde_json::from_value::<Decision>(v)
                .map_err(|e| AiGateError::Schema(format!("modified_decision: {e}")))?,
        ),
        (AiVerdict::Modify, None) => {
            return Err(AiGateError::Schema("MODIFY requires modified_decision".into()));
        }
        (_, Some(_)) => {
            return Err(AiGateError::Schema("modified_decision only allowed with MODIFY".into()));
        }
        (_, None) => None,
    };

    Ok(GateReply {
        verdict,
        reasons,
        modified_decision,
    })
}
