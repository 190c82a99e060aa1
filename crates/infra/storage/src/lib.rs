//! Persistent state for the spot agent
//!
//! - SQLite store with WAL journaling, foreign keys and a busy timeout
//! - Versioned schema migrations
//! - Audit writer: bounded queue, single drain task, two sinks
//! - Order-intent ledger with non-regressing state updates
//! - Selection and advisory-gate tables for post-hoc analysis
//! - Redaction of secrets before anything reaches disk

#![forbid(unsafe_code)]

pub mod advisory;
pub mod audit;
pub mod dayfile;
pub mod error;
pub mod intents;
pub mod redaction;
pub mod schema;
pub mod selection;
pub mod store;

pub use advisory::AiGateEventRow;
pub use audit::{AuditRecord, AuditStats, AuditTicket, AuditWriter, RESERVED_KEYS};
pub use error::{AuditError, RedactionError, StoreError, StoreResult};
pub use intents::{IntentLedger, TransitionUpdate};
pub use redaction::RedactionPolicy;
pub use selection::{RankingRow, RankingStage, SelectionLog, SelectionRow, UniverseScanRow};
pub use store::Store;
