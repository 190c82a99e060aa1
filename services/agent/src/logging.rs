//! Tracing subscriber setup for the binary

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str =
    "spot_agent=info,oms=info,risk_manager=info,ai_gate=info,monitoring=info,engine=info,feeds=info,storage=info,common=info,warn";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber
///
/// Stdout gets human-readable lines, or JSON objects with `json`. With a
/// `log_dir`, a daily-rolling JSON file is added; the returned guard must be
/// held until exit or buffered lines are lost. A second call is a no-op.
pub fn init_logging(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stdout = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_filter(filter())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_filter(filter())
            .boxed()
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "spot-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // already installed, e.g. by a test harness
    let _ = tracing_subscriber::registry().with(stdout).with(file).try_init();
    guard
}
