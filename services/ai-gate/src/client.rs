//! Chat-completions client for the advisory model

use crate::error::{AiGateError, GateResult};
use crate::payload::GatePayload;
use crate::prompt::{PromptAssets, SCHEMA_NAME};
use async_trait::async_trait;
use common::canonical::to_canonical_json;
use common::config::AiGateConfig;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Endpoint appended to the configured base URL
pub const COMPLETIONS_PATH: &str = "/chat/completions";

/// Transport to the advisory model
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model name sent with each request
    fn model(&self) -> &str;

    /// POST `request` and return the raw response body
    async fn complete(&self, request: &Value) -> GateResult<String>;
}

/// Request body: system and user messages plus the strict result schema
///
/// # Errors
///
/// Returns an error if the payload cannot be canonicalized.
pub fn build_request(model: &str, assets: &PromptAssets, payload: &GatePayload) -> GateResult<Value> {
    let user = to_canonical_json(payload)?;
    Ok(json!({
        "model": model,
        "temperature": 0,
        "messages": [
            {"role": "system", "content": assets.system},
            {"role": "user", "content": user},
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": SCHEMA_NAME,
                "strict": true,
                "schema": assets.schema,
            },
        },
    }))
}

/// OpenAI-compatible `chat/completions` client
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    timeout_ms: u64,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("url", &self.url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsClient {
    /// Client for the `aigate` config section
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(cfg: &AiGateConfig) -> GateResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.aigate_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            url: format!("{}{COMPLETIONS_PATH}", cfg.base_url.trim_end_matches('/')),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            timeout_ms: cfg.aigate_timeout_ms,
        })
    }
}

#[async_trait]
impl ModelClient for ChatCompletionsClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &Value) -> GateResult<String> {
        let timeout = |e: reqwest::Error| {
            if e.is_timeout() {
                AiGateError::Timeout {
                    timeout_ms: self.timeout_ms,
                }
            } else {
                AiGateError::from(e)
            }
        };
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(timeout)?;
        let status = resp.status();
        let body = resp.text().await.map_err(timeout)?;
        debug!(status = status.as_u16(), bytes = body.len(), "advisory response");
        if !status.is_success() {
            return Err(AiGateError::Http(format!("status {}", status.as_u16())));
        }
        Ok(body)
    }
}
