//! Request payload shown to the model
//!
//! A projection of (decision, snapshot) that carries no account or
//! credential data. `input_hash` is the canonical hash of the payload with
//! the hash field itself cleared, so identical reviews hash identically.

use common::canonical::canonical_hash;
use common::model::decision::{Decision, DecisionIntent, EntryPlan, ExitPlan, Side};
use common::model::snapshot::{CostInputs, Micro, Regime, Snapshot, Volatility};
use common::{CommonResult, ReasonCode};
use serde::{Deserialize, Serialize};

/// What the model reviews
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePayload {
    /// Reviewed decision
    pub decision_id: String,
    /// Snapshot it was derived from
    pub snapshot_id: String,
    /// Hash of that snapshot
    pub snapshot_hash: String,
    /// Canonical hash of this payload with this field empty
    pub input_hash: String,
    /// Always `LIVE`
    pub mode: String,
    /// Symbol
    pub symbol: String,
    /// Side
    pub side: Side,
    /// Intent
    pub intent: DecisionIntent,
    /// Edge score in [0, 10000]
    pub edge_score_x10000: i64,
    /// Expected edge after costs
    pub expected_edge_bps: i64,
    /// Strategy reasons
    pub reasons: Vec<ReasonCode>,
    /// Regime
    pub regime: Regime,
    /// 60s micro-structure
    pub micro_60s: Micro,
    /// ATR
    pub volatility: Volatility,
    /// Fees and slippage
    pub cost_inputs: CostInputs,
    /// Entry plan, the base of any modification
    pub entry: Option<EntryPlan>,
    /// Exit plan
    pub exit: Option<ExitPlan>,
}

impl GatePayload {
    /// Project and hash
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be canonicalized.
    pub fn build(decision: &Decision, snapshot: &Snapshot) -> CommonResult<Self> {
        let mut payload = Self {
            decision_id: decision.decision_id.clone(),
            snapshot_id: snapshot.meta.snapshot_id.clone(),
            snapshot_hash: snapshot.meta.snapshot_hash.clone(),
            input_hash: String::new(),
            mode: decision.mode.clone(),
            symbol: decision.symbol.clone(),
            side: decision.side,
            intent: decision.intent,
            edge_score_x10000: decision.edge_score_x10000,
            expected_edge_bps: decision.expected_edge_bps,
            reasons: decision.reasons.clone(),
            regime: snapshot.regime.clone(),
            micro_60s: snapshot.micro_60s.clone(),
            volatility: snapshot.volatility.clone(),
            cost_inputs: snapshot.cost_inputs.clone(),
            entry: decision.entry.clone(),
            exit: decision.exit.clone(),
        };
        payload.input_hash = canonical_hash(&payload)?;
        Ok(payload)
    }

    /// Recompute the hash over the payload with `input_hash` cleared
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be canonicalized.
    pub fn expected_hash(&self) -> CommonResult<String> {
        let mut cleared = self.clone();
        cleared.input_hash.clear();
        canonical_hash(&cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::StrategyConfig;
    use common::model::market::fixtures::btc_filters;
    use common::model::snapshot::fixtures::{T0, trend_snapshot};
    use engine::{Proposal, propose_entry};

    fn decision(snapshot: &Snapshot) -> Decision {
        let cfg = StrategyConfig {
            pullback_max_bps: 150,
            ..StrategyConfig::default()
        };
        let constraints = btc_filters().to_constraints().unwrap();
        match propose_entry(&cfg, snapshot, &constraints, "cyc_gate", T0).unwrap() {
            Proposal::Entry(d) => *d,
            Proposal::NoTrade { reasons, .. } => panic!("{reasons:?}"),
        }
    }

    #[test]
    fn test_input_hash_covers_payload_without_itself() {
        let s = trend_snapshot();
        let p = GatePayload::build(&decision(&s), &s).unwrap();
        assert_eq!(p.input_hash.len(), 64);
        assert_eq!(p.expected_hash().unwrap(), p.input_hash);
        assert_eq!(p.snapshot_hash, s.meta.snapshot_hash);
    }

    #[test]
    fn test_input_hash_tracks_market_state() {
        let s = trend_snapshot();
        let d = decision(&s);
        let a = GatePayload::build(&d, &s).unwrap();
        let mut wider = s.clone();
        wider.micro_60s.spread_current_bps += 1;
        let b = GatePayload::build(&d, &wider).unwrap();
        assert_ne!(a.input_hash, b.input_hash);
    }
}
