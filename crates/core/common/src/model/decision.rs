//! Decisions and the verdicts attached to them

use crate::MODE_LIVE;
use crate::canonical::canonical_hash;
use crate::closed_set;
use crate::decimal::parse_decimal;
use crate::error::{CommonError, CommonResult};
use crate::ids::{CLIENT_ORDER_ID_LEN, validate_correlation_id};
use crate::model::market::DecisionConstraints;
use crate::model::snapshot::CostInputs;
use crate::reason::{ReasonCode, validate_reasons};
use crate::stage::Stage;
use serde::{Deserialize, Serialize};

closed_set! {
    /// Order side
    pub enum Side: "side" {
        Buy => "BUY",
        Sell => "SELL",
    }
}

closed_set! {
    /// What the decision wants to do
    pub enum DecisionIntent: "intent" {
        Entry => "ENTRY",
        Exit => "EXIT",
        Manage => "MANAGE",
    }
}

closed_set! {
    /// Entry execution style
    pub enum EntryKind: "entry_kind" {
        MakerFirst => "MAKER_FIRST",
        Taker => "TAKER",
        Market => "MARKET",
    }
}

closed_set! {
    /// Time in force
    pub enum TimeInForce: "time_in_force" {
        Gtc => "GTC",
        Ioc => "IOC",
        Fok => "FOK",
    }
}

closed_set! {
    /// Fallback after the maker window expires
    pub enum FallbackKind: "fallback_kind" {
        None => "NONE",
        CancelAndReplace => "CANCEL_AND_REPLACE",
        MarketIfAllowed => "MARKET_IF_ALLOWED",
        IocLimit => "IOC_LIMIT",
    }
}

closed_set! {
    /// How TP and SL are installed
    pub enum ProtectionMode: "protection" {
        Oco => "OCO",
        TpSlSeparate => "TP_SL_SEPARATE",
    }
}

closed_set! {
    /// Trailing stop style
    pub enum TrailingMode: "trailing" {
        Off => "OFF",
        Virtual => "VIRTUAL",
        Native => "NATIVE",
    }
}

closed_set! {
    /// Risk gate outcome
    pub enum RiskOutcome: "risk_verdict" {
        Allow => "ALLOW",
        Block => "BLOCK",
    }
}

closed_set! {
    /// Advisory gate outcome; ERROR is only ever synthesized locally
    pub enum AiVerdict: "ai_verdict" {
        Allow => "ALLOW",
        Block => "BLOCK",
        Modify => "MODIFY",
        Error => "ERROR",
    }
}

impl EntryKind {
    /// MARKET > TAKER > MAKER_FIRST
    #[must_use]
    pub const fn aggressiveness(&self) -> u8 {
        match self {
            Self::MakerFirst => 0,
            Self::Taker => 1,
            Self::Market => 2,
        }
    }
}

impl FallbackKind {
    /// MARKET_IF_ALLOWED > IOC_LIMIT > CANCEL_AND_REPLACE
    #[must_use]
    pub const fn aggressiveness(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::CancelAndReplace => 1,
            Self::IocLimit => 2,
            Self::MarketIfAllowed => 3,
        }
    }
}

impl TrailingMode {
    /// NATIVE > VIRTUAL > OFF
    #[must_use]
    pub const fn aggressiveness(&self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Virtual => 1,
            Self::Native => 2,
        }
    }
}

impl Side {
    /// Opposite side
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Fallback after the maker window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPlan {
    /// Armed at all
    pub enabled: bool,
    /// Fallback style
    pub kind: FallbackKind,
    /// Slippage ceiling
    pub max_slippage_bps: i64,
    /// Give up after this long
    pub deadline_ms: i64,
}

impl FallbackPlan {
    /// Disarmed fallback
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            kind: FallbackKind::None,
            max_slippage_bps: 0,
            deadline_ms: 0,
        }
    }
}

/// How to enter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPlan {
    /// Execution style
    pub kind: EntryKind,
    /// Price the strategy would like
    pub desired_price: String,
    /// Price actually posted
    pub limit_price: String,
    /// Base quantity
    pub qty: String,
    /// Time in force
    pub time_in_force: TimeInForce,
    /// Maker window
    pub ttl_ms: i64,
    /// Reprice interval
    pub reprice_ms: i64,
    /// Reprice budget
    pub max_reprices: i64,
    /// Exchange dedup id
    pub client_order_id: String,
    /// Fallback
    pub fallback: FallbackPlan,
}

/// Trailing stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingPlan {
    /// Style
    pub mode: TrailingMode,
    /// Activation price; `""` or `"0"` when off
    pub trigger_price: String,
    /// Trailing distance
    pub delta_bips: i64,
}

impl TrailingPlan {
    /// No trailing
    #[must_use]
    pub fn off() -> Self {
        Self {
            mode: TrailingMode::Off,
            trigger_price: String::new(),
            delta_bips: 0,
        }
    }
}

/// Protective exits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPlan {
    /// Take-profit price
    pub tp_price: String,
    /// Stop-loss price
    pub sl_price: String,
    /// Installation style
    pub protection: ProtectionMode,
    /// Trailing stop
    pub trailing: TrailingPlan,
    /// Take-profit leg client id
    pub tp_client_order_id: String,
    /// Stop-loss leg client id
    pub sl_client_order_id: String,
}

/// Limits in force when a risk verdict was taken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLimits {
    /// Base minimum edge
    pub base_min_edge_bps: i64,
    /// Adaptive multiplier applied
    pub min_edge_multiplier_x10000: i64,
    /// Effective minimum edge
    pub adjusted_min_edge_bps: i64,
    /// Trades in the rolling window
    pub trades_in_window: u32,
    /// Trades today
    pub trades_today: u32,
    /// Open orders
    pub open_orders: u32,
    /// Symbol exposure after this entry
    pub symbol_exposure_after: String,
    /// Total exposure after this entry
    pub total_exposure_after: String,
    /// Quote needed for this entry
    pub required_quote: String,
    /// Quote available for new entries
    pub available_quote: String,
}

/// Typed outcome of the risk gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskVerdict {
    /// Allow or block
    pub verdict: RiskOutcome,
    /// Every applicable reason
    pub reasons: Vec<ReasonCode>,
    /// Limits in force
    pub limits: ActiveLimits,
    /// Cost inputs evaluated
    pub cost_inputs: CostInputs,
}

impl RiskVerdict {
    /// Whether the entry may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.verdict == RiskOutcome::Allow
    }
}

/// Outcome of the advisory gate as attached to a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiGateResult {
    /// Verdict
    pub verdict: AiVerdict,
    /// Reasons; for ERROR the single failure reason
    pub reasons: Vec<ReasonCode>,
    /// Hash of the request payload
    pub input_hash: String,
    /// Model consulted
    pub model: String,
    /// Call latency
    pub latency_ms: i64,
    /// A MODIFY passed the monotone policy and was applied
    pub modify_applied: bool,
}

/// A typed entry/exit/manage proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Always `LIVE`
    pub mode: String,
    /// Proposal time
    pub ts_ms: i64,
    /// Symbol
    pub symbol: String,
    /// Side
    pub side: Side,
    /// Intent
    pub intent: DecisionIntent,
    /// Entry plan, required for ENTRY
    pub entry: Option<EntryPlan>,
    /// Exit plan
    pub exit: Option<ExitPlan>,
    /// Score in [0, 10000]
    pub edge_score_x10000: i64,
    /// Expected edge after costs
    pub expected_edge_bps: i64,
    /// Why
    pub reasons: Vec<ReasonCode>,
    /// Snapshot this was derived from
    pub snapshot_id: String,
    /// Hash of that snapshot
    pub snapshot_hash: String,
    /// `dec_` + canonical hash of [`Decision::decision_hash_payload`]
    pub decision_id: String,
    /// Cycle
    pub cycle_id: String,
    /// Stage that produced it
    pub stage: Stage,
    /// Exchange constraints
    pub constraints: DecisionConstraints,
    /// Advisory verdict, once consulted
    pub aigate: Option<AiGateResult>,
    /// Risk verdict, once evaluated
    pub risk: Option<RiskVerdict>,
}

#[derive(Serialize)]
struct DecisionHashPayload<'a> {
    cycle_id: &'a str,
    stage: Stage,
    ts_ms: i64,
    symbol: &'a str,
    side: Side,
    intent: DecisionIntent,
    edge_score_x10000: i64,
    expected_edge_bps: i64,
    snapshot_hash: &'a str,
    constraints: &'a DecisionConstraints,
    entry: &'a Option<EntryPlan>,
    exit: &'a Option<ExitPlan>,
}

impl Decision {
    /// Projection that defines the decision id
    ///
    /// # Errors
    ///
    /// Returns an error if the projection cannot be serialized.
    pub fn decision_hash_payload(&self, snapshot_hash: &str) -> CommonResult<serde_json::Value> {
        let payload = DecisionHashPayload {
            cycle_id: &self.cycle_id,
            stage: self.stage,
            ts_ms: self.ts_ms,
            symbol: &self.symbol,
            side: self.side,
            intent: self.intent,
            edge_score_x10000: self.edge_score_x10000,
            expected_edge_bps: self.expected_edge_bps,
            snapshot_hash,
            constraints: &self.constraints,
            entry: &self.entry,
            exit: &self.exit,
        };
        Ok(serde_json::to_value(payload)?)
    }

    /// `dec_` + canonical hash over the payload for `snapshot_hash`
    pub fn compute_id(&self, snapshot_hash: &str) -> CommonResult<String> {
        Ok(format!("dec_{}", canonical_hash(&self.decision_hash_payload(snapshot_hash)?)?))
    }

    /// Set `decision_id` from the current content
    pub fn seal(&mut self) -> CommonResult<()> {
        self.decision_id = self.compute_id(&self.snapshot_hash)?;
        Ok(())
    }

    /// Enforce every decision invariant
    pub fn validate(&self) -> CommonResult<()> {
        if self.mode != MODE_LIVE {
            return Err(CommonError::schema("mode", format!("must be LIVE, got {:?}", self.mode)));
        }
        if self.ts_ms <= 0 {
            return Err(CommonError::schema("ts_ms", "must be positive"));
        }
        if self.symbol.is_empty() {
            return Err(CommonError::schema("symbol", "empty"));
        }
        if !(0..=10_000).contains(&self.edge_score_x10000) {
            return Err(CommonError::schema("edge_score_x10000", "out of [0, 10000]"));
        }
        validate_reasons(&self.reasons)?;
        validate_correlation_id("cycle_id", &self.cycle_id)?;
        validate_correlation_id("snapshot_id", &self.snapshot_id)?;
        self.constraints.validate()?;

        if self.intent == DecisionIntent::Entry && self.entry.is_none() {
            return Err(CommonError::schema("entry", "required for ENTRY"));
        }
        if let Some(entry) = &self.entry {
            validate_entry(entry)?;
        }
        if let Some(exit) = &self.exit {
            let reference = match &self.entry {
                Some(e) => parse_decimal(&e.limit_price)?,
                None => return Err(CommonError::schema("exit", "exit plan needs an entry reference")),
            };
            validate_exit(exit, self.side, reference)?;
        }

        if !self.decision_id.is_empty() {
            let expected = self.compute_id(&self.snapshot_hash)?;
            if expected != self.decision_id {
                return Err(CommonError::schema("decision_id", "does not match payload"));
            }
        }
        Ok(())
    }
}

fn check_client_id(field: &str, id: &str) -> CommonResult<()> {
    if id.len() != CLIENT_ORDER_ID_LEN {
        return Err(CommonError::schema(
            field,
            format!("must be {CLIENT_ORDER_ID_LEN} chars, got {}", id.len()),
        ));
    }
    Ok(())
}

fn validate_entry(entry: &EntryPlan) -> CommonResult<()> {
    parse_decimal(&entry.desired_price)?;
    parse_decimal(&entry.limit_price)?;
    parse_decimal(&entry.qty)?;
    if entry.ttl_ms < 0 || entry.reprice_ms < 0 || entry.max_reprices < 0 {
        return Err(CommonError::schema("entry", "ttl, reprice and max_reprices must be non-negative"));
    }
    if entry.kind == EntryKind::MakerFirst
        && (entry.ttl_ms <= 0 || entry.max_reprices < 1 || entry.time_in_force != TimeInForce::Gtc)
    {
        return Err(CommonError::schema(
            "entry",
            "MAKER_FIRST requires ttl > 0, max_reprices >= 1 and GTC",
        ));
    }
    check_client_id("entry.client_order_id", &entry.client_order_id)?;
    let fb = &entry.fallback;
    if fb.enabled
        && (fb.kind == FallbackKind::None || fb.max_slippage_bps <= 0 || fb.deadline_ms <= 0)
    {
        return Err(CommonError::schema(
            "entry.fallback",
            "enabled fallback needs a kind, positive slippage and deadline",
        ));
    }
    Ok(())
}

fn validate_exit(exit: &ExitPlan, side: Side, entry: rust_decimal::Decimal) -> CommonResult<()> {
    let tp = parse_decimal(&exit.tp_price)?;
    let sl = parse_decimal(&exit.sl_price)?;
    let ordered = match side {
        Side::Buy => tp > entry && entry > sl,
        Side::Sell => sl > entry && entry > tp,
    };
    if !ordered {
        return Err(CommonError::schema("exit", "tp/entry/sl ordering violated"));
    }
    let t = &exit.trailing;
    match t.mode {
        TrailingMode::Off => {
            if !(t.trigger_price.is_empty() || t.trigger_price == "0") || t.delta_bips != 0 {
                return Err(CommonError::schema("exit.trailing", "OFF requires empty trigger and zero delta"));
            }
        }
        TrailingMode::Native => {
            if t.delta_bips < 1 {
                return Err(CommonError::schema("exit.trailing", "NATIVE requires delta_bips >= 1"));
            }
        }
        TrailingMode::Virtual => {}
    }
    check_client_id("exit.tp_client_order_id", &exit.tp_client_order_id)?;
    check_client_id("exit.sl_client_order_id", &exit.sl_client_order_id)?;
    Ok(())
}
