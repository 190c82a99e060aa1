//! Per-cycle data model
//!
//! - [`market`]: raw market inputs and exchange filters
//! - [`snapshot`]: immutable per-symbol market state with its content hash
//! - [`decision`]: entry/exit plans, risk and advisory verdicts
//! - [`intent`]: persisted order intents and their state machine

pub mod decision;
pub mod intent;
pub mod market;
pub mod snapshot;

pub use decision::{
    ActiveLimits, AiGateResult, AiVerdict, Decision, DecisionIntent, EntryKind, EntryPlan, ExitPlan,
    FallbackKind, FallbackPlan, ProtectionMode, RiskOutcome, RiskVerdict, Side, TimeInForce,
    TrailingMode, TrailingPlan,
};
pub use intent::{IntentAction, IntentState, OrderIntent, OrderIntentKey};
pub use market::{
    BookSample, Candle, DecisionConstraints, QuantizationPolicy, SymbolFilters, Ticker24h,
    TrailingDeltaFilter,
};
pub use snapshot::{
    ConfigReference, CostInputs, HealthFlags, Micro, Prices, Regime, RegimeLabel, ReturnsSeries,
    Snapshot, SnapshotBudgets, SnapshotMeta, SourceHashes, Stats24h, Volatility,
};
