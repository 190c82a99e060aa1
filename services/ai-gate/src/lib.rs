//! Advisory model gate for entry decisions
//!
//! - Builds a credential-free payload from the decision and its snapshot
//! - Asks an OpenAI-compatible endpoint for a strict-schema verdict
//! - Accepts MODIFY only when every change is more conservative
//! - Turns timeouts, HTTP failures and malformed answers into an ERROR
//!   verdict that lets the original decision continue
//! - Produces one redacted audit record and one `ai_gate_events` row per call

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod gate;
pub mod modify;
pub mod payload;
pub mod prompt;
pub mod response;

pub use client::{ChatCompletionsClient, ModelClient, build_request};
pub use error::{AiGateError, GateResult};
pub use gate::{AiGate, GateOutcome, ReviewScope};
pub use modify::{apply_modify, check_modify};
pub use payload::GatePayload;
pub use prompt::PromptAssets;
pub use response::{GateReply, parse_reply};
