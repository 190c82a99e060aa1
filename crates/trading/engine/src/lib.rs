//! Per-cycle market analysis for the spot agent
//!
//! - [`snapshot`]: assemble and seal one symbol's market state
//! - [`selection`]: universe scan, rank top-N, deep scan, correlation-aware top-K
//! - [`strategy`]: regime-aware pullback entries with ATR-scaled exits
//! - [`indicators`]: Wilder ATR/ADX, EMA, percentiles, Pearson, log-returns
//!
//! Everything here is synchronous and deterministic; identical inputs give
//! identical hashes and decision ids.

#![forbid(unsafe_code)]

pub mod error;
pub mod indicators;
pub mod selection;
pub mod snapshot;
pub mod strategy;

pub use error::{EngineError, EngineResult};
pub use selection::{
    DeepScore, PairOverLimit, PreviousTopK, RankedSymbol, TopKCandidate, TopKEntry, TopKOutcome,
    UniverseVerdict, deep_scan, rank_top_n, select_top_k, universe_scan,
};
pub use snapshot::{CandleSeries, KLINE_LIMIT, SnapshotBuilder, SnapshotInputs};
pub use strategy::{Proposal, assign_client_ids, propose_entry};
