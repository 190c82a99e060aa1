//! Spot trading agent
//!
//! Wires the workspace crates into a running process:
//! - [`orchestrator`]: stage sequencing, correlation ids, mode gating
//! - [`pipeline`]: the work behind each live stage
//! - [`reconcile`]: local-vs-remote drift scoring
//! - [`account`]: account state for the risk gate
//! - [`doctor`]: startup checks
//! - [`summary`]: daily counts
//! - [`runtime`]: process wiring for the CLI commands

#![forbid(unsafe_code)]

pub mod account;
pub mod context;
pub mod doctor;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod reporter;
pub mod runtime;
pub mod summary;

pub use context::AgentContext;
pub use doctor::{CheckStatus, DoctorCheck, DoctorReport, run_checks};
pub use orchestrator::{DryRun, Orchestrator, StageCtx, StageWork, WalkOutcome};
pub use pipeline::LivePipeline;
pub use reconcile::{DriftAction, DriftDiff, DriftReport, LocalView, Reconciler, RemoteView, TrackedSymbol, drift_diff};
pub use reporter::{ConsoleReporter, StageEvent, StageReporter, TracingReporter};
pub use runtime::{DryRunReport, RunOptions};
pub use summary::{DailySummary, SummaryTracker};
