//! Side-channel notification of stage transitions

use common::{Stage, SystemMode};
use tracing::info;

/// One stage transition as seen by a reporter
#[derive(Debug, Clone, Copy)]
pub struct StageEvent<'a> {
    /// Process run
    pub run_id: &'a str,
    /// Cycle
    pub cycle_id: &'a str,
    /// Stage entered, or the supervisory stage recording a skip
    pub stage: Stage,
    /// Stage that was skipped, if any
    pub skipped: Option<Stage>,
    /// Mode at the gate
    pub mode: SystemMode,
}

/// Receives every STAGE_CHANGED alongside the audit trail
pub trait StageReporter: Send + Sync {
    /// Called after the transition is durable
    fn report(&self, event: &StageEvent<'_>);
}

/// One line per transition on stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl StageReporter for ConsoleReporter {
    fn report(&self, event: &StageEvent<'_>) {
        match event.skipped {
            Some(skipped) => println!(
                "{} {} {} skipped ({})",
                event.cycle_id, event.stage, skipped, event.mode
            ),
            None => println!("{} {} ({})", event.cycle_id, event.stage, event.mode),
        }
    }
}

/// Transitions as `info` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StageReporter for TracingReporter {
    fn report(&self, event: &StageEvent<'_>) {
        info!(
            run_id = event.run_id,
            cycle_id = event.cycle_id,
            stage = %event.stage,
            skipped = ?event.skipped,
            mode = %event.mode,
            "stage"
        );
    }
}
