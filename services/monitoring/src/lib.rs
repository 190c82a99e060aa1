//! Monitoring Service
//!
//! Supervision of the spot agent: the health evaluator and the task that
//! publishes the system mode, soak readiness reports, and the Prometheus
//! metrics with their HTTP endpoints.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod disk;
pub mod error;
pub mod health;
pub mod metrics;
pub mod server;
pub mod soak;
pub mod supervisor;

pub use disk::disk_free_bytes;
pub use error::{MonitoringError, MonitoringResult};
pub use health::{Assessment, HealthEvaluator, HealthReport, HealthSignals, HealthThresholds, assess};
pub use metrics::AgentMetrics;
pub use server::{MetricsState, router, serve, serve_on};
pub use soak::{SoakReport, SoakSummary, soak_tick};
pub use supervisor::{HealthSupervisor, Heartbeats};
