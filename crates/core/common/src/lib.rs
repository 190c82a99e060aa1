//! Shared building blocks for the spot trading agent
//!
//! - Canonical JSON and content hashing used by every identifier
//! - Closed registries (reason codes, stages, event types)
//! - Decimal string discipline for prices and quantities
//! - The per-cycle data model: snapshots, decisions, order intents
//! - Process-wide system mode, clocks and correlation ids
//! - Agent configuration

#![forbid(unsafe_code)]

pub mod registry;

pub mod canonical;
pub mod config;
pub mod decimal;
pub mod error;
pub mod ids;
pub mod mode;
pub mod model;
pub mod reason;
pub mod stage;

pub use canonical::{canonical_hash, canonical_json, sha256_hex, to_canonical_json};
pub use config::AgentConfig;
pub use decimal::{decimal_places, parse_decimal, quantize_down};
pub use error::{CommonError, CommonResult, ErrorKind};
pub use ids::{Clock, ManualClock, NonceSource, SystemClock, ThreadRngNonce};
pub use mode::{SystemMode, SystemModeCell};
pub use reason::ReasonCode;
pub use stage::{EventType, Stage};

/// The only run mode this agent trades in.
pub const MODE_LIVE: &str = "LIVE";
