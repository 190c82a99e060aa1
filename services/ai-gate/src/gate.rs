//! Advisory review of one decision
//!
//! The model may approve, block or tighten an entry. Any failure to obtain
//! a schema-valid answer becomes a local ERROR verdict and the original
//! decision proceeds unchanged. Each call yields one audit record and one
//! `ai_gate_events` row.

use crate::client::{ChatCompletionsClient, ModelClient, build_request};
use crate::error::{AiGateError, GateResult};
use crate::modify::apply_modify;
use crate::payload::GatePayload;
use crate::prompt::PromptAssets;
use crate::response::{message_content, parse_reply};
use common::canonical::sha256_hex;
use common::config::AiGateConfig;
use common::model::decision::{AiGateResult, AiVerdict, Decision};
use common::model::snapshot::Snapshot;
use common::{Clock, EventType, ReasonCode, Stage};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{AiGateEventRow, AuditError, AuditRecord, AuditWriter, RedactionPolicy, Store};
use tracing::{info, warn};

/// Identifies the run and cycle a review belongs to
#[derive(Debug, Clone, Copy)]
pub struct ReviewScope<'a> {
    /// Process run
    pub run_id: &'a str,
    /// Cycle
    pub cycle_id: &'a str,
}

/// Result of one review
#[derive(Debug, Clone)]
pub struct GateOutcome {
    /// Decision to continue with, verdict attached
    pub decision: Decision,
    /// Verdict as attached to the decision
    pub result: AiGateResult,
    /// Audit record for the call
    pub audit: AuditRecord,
    /// Row for `ai_gate_events`
    pub event: AiGateEventRow,
}

impl GateOutcome {
    /// False only when the model blocked the entry
    #[must_use]
    pub fn proceeds(&self) -> bool {
        self.result.verdict != AiVerdict::Block
    }

    /// Write the audit record and the event row
    ///
    /// # Errors
    ///
    /// Returns an error if either sink rejects the record.
    pub async fn persist(&self, audit: &AuditWriter, store: &Store) -> Result<(), AuditError> {
        audit.write(self.audit.clone()).await?;
        storage::advisory::insert_ai_gate_event(store, &self.event, self.audit.ts_ms).await?;
        Ok(())
    }
}

struct Exchange {
    request: Value,
    raw: Option<String>,
    outcome: GateResult<(AiVerdict, Vec<ReasonCode>, Option<Decision>)>,
}

/// Advisory gate
pub struct AiGate {
    enabled: bool,
    timeout_ms: u64,
    client: Arc<dyn ModelClient>,
    assets: PromptAssets,
    redaction: RedactionPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AiGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiGate")
            .field("enabled", &self.enabled)
            .field("model", &self.client.model())
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl AiGate {
    /// Gate over an explicit client
    #[must_use]
    pub fn new(
        cfg: &AiGateConfig,
        client: Arc<dyn ModelClient>,
        assets: PromptAssets,
        redaction: RedactionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            enabled: cfg.enabled,
            timeout_ms: cfg.aigate_timeout_ms,
            client,
            assets,
            redaction,
            clock,
        }
    }

    /// Gate with the chat-completions client and the configured prompt assets
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt assets or the HTTP client are invalid.
    pub fn from_config(cfg: &AiGateConfig, redaction: RedactionPolicy, clock: Arc<dyn Clock>) -> GateResult<Self> {
        let assets = PromptAssets::load(cfg.prompt_dir.as_deref())?;
        let client = Arc::new(ChatCompletionsClient::new(cfg)?);
        Ok(Self::new(cfg, client, assets, redaction, clock))
    }

    /// Whether the model is consulted at all
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Review `decision` against `snapshot`
    ///
    /// Returns `None` when the gate is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error only if the payload cannot be canonicalized; every
    /// model-side failure becomes an ERROR verdict instead.
    pub async fn review(
        &self,
        scope: ReviewScope<'_>,
        decision: &Decision,
        snapshot: &Snapshot,
    ) -> GateResult<Option<GateOutcome>> {
        if !self.enabled {
            return Ok(None);
        }
        let payload = GatePayload::build(decision, snapshot)?;
        let started = Instant::now();
        let exchange = self.exchange(decision, &payload).await?;
        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let (verdict, reasons, modified, error) = match exchange.outcome {
            Ok((v, r, m)) => (v, r, m, None),
            Err(e) => {
                warn!(
                    symbol = %decision.symbol,
                    decision_id = %decision.decision_id,
                    error = %e,
                    "advisory call failed, continuing without it"
                );
                (AiVerdict::Error, vec![e.reason()], None, Some(e))
            }
        };

        let result = AiGateResult {
            verdict,
            reasons: reasons.clone(),
            input_hash: payload.input_hash.clone(),
            model: self.client.model().to_string(),
            latency_ms,
            modify_applied: modified.is_some(),
        };
        let mut final_decision = modified.clone().unwrap_or_else(|| decision.clone());
        final_decision.aigate = Some(result.clone());

        info!(
            symbol = %decision.symbol,
            decision_id = %decision.decision_id,
            verdict = %verdict,
            latency_ms,
            modify_applied = result.modify_applied,
            "advisory verdict"
        );

        let request_json = self.redacted(&exchange.request);
        let response_json = exchange.raw.as_deref().map(|raw| {
            serde_json::from_str::<Value>(raw).map_or_else(|_| self.redacted_text(raw), |v| self.redacted(&v))
        });
        let modified_json = modified
            .as_ref()
            .map(|d| serde_json::to_value(d).map_or_else(|e| e.to_string(), |v| self.redacted(&v)));
        let error_detail = error.as_ref().map(|e| self.redacted_text(&e.to_string()));
        let error_code = error.as_ref().map(|e| e.reason().to_string());

        let ts_ms = self.clock.now_ms();
        let audit = AuditRecord::new(
            ts_ms,
            scope.run_id,
            scope.cycle_id,
            Stage::AigateCall,
            EventType::AigateCall,
            reasons.clone(),
        )
        .with_snapshot(&snapshot.meta.snapshot_id)
        .with_decision(&decision.decision_id)
        .with_times(snapshot.meta.exchange_time_ms, snapshot.meta.local_received_ms)
        .with_data(json!({
            "verdict": verdict.as_str(),
            "input_hash": payload.input_hash,
            "model": result.model,
            "latency_ms": latency_ms,
            "modify_applied": result.modify_applied,
            "final_decision_id": final_decision.decision_id,
            "request_json": request_json,
            "response_json": response_json,
            "modify_patch_json": modified_json,
            "error_kind": error.as_ref().map(|e| e.kind().as_str()),
        }));

        let event = AiGateEventRow {
            run_id: scope.run_id.to_string(),
            cycle_id: scope.cycle_id.to_string(),
            mode: decision.mode.clone(),
            stage: Stage::AigateCall.as_str().to_string(),
            event_type: EventType::AigateCall.as_str().to_string(),
            snapshot_id: snapshot.meta.snapshot_id.clone(),
            snapshot_hash: snapshot.meta.snapshot_hash.clone(),
            decision_id: decision.decision_id.clone(),
            input_hash: payload.input_hash.clone(),
            enabled: true,
            verdict: verdict.as_str().to_string(),
            reasons: reasons.iter().map(|r| r.as_str().to_string()).collect(),
            model: result.model.clone(),
            latency_ms,
            raw_hash: exchange.raw.as_deref().map(|raw| sha256_hex(raw.as_bytes())),
            request_json_redacted: Some(request_json),
            response_json_redacted: response_json,
            modified_decision_json_redacted: modified_json,
            modify_applied: result.modify_applied,
            error_code,
            error_detail_redacted: error_detail,
            exchange_time_ms: Some(snapshot.meta.exchange_time_ms),
            local_received_ms: Some(snapshot.meta.local_received_ms),
        };

        Ok(Some(GateOutcome {
            decision: final_decision,
            result,
            audit,
            event,
        }))
    }

    async fn exchange(&self, decision: &Decision, payload: &GatePayload) -> GateResult<Exchange> {
        let request = build_request(self.client.model(), &self.assets, payload)?;
        let deadline = Duration::from_millis(self.timeout_ms);
        let raw = match tokio::time::timeout(deadline, self.client.complete(&request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                return Ok(Exchange {
                    request,
                    raw: None,
                    outcome: Err(e),
                });
            }
            Err(_) => {
                return Ok(Exchange {
                    request,
                    raw: None,
                    outcome: Err(AiGateError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }),
                });
            }
        };

        let outcome = message_content(&raw).and_then(|content| parse_reply(&content)).and_then(|reply| {
            let modified = match &reply.modified_decision {
                Some(m) => Some(apply_modify(decision, m)?),
                None => None,
            };
            Ok((reply.verdict, reply.reasons, modified))
        });
        Ok(Exchange {
            request,
            raw: Some(raw),
            outcome,
        })
    }

    fn redacted(&self, value: &Value) -> String {
        self.redaction
            .redact_to_string(value)
            .unwrap_or_else(|e| format!("<REDACTION_REFUSED {e}>"))
    }

    fn redacted_text(&self, text: &str) -> String {
        self.redaction
            .redact_text(text)
            .unwrap_or_else(|e| format!("<REDACTION_REFUSED {e}>"))
    }
}
