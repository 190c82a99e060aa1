//! Startup checks
//!
//! Run at DOCTOR_CHECKS before anything is traded, and on demand by the
//! `doctor` command. Every check runs; the report passes only when none
//! fails.

use ai_gate::PromptAssets;
use common::{AgentConfig, Clock};
use feeds::ExchangeRest;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use storage::Store;
use tracing::{info, warn};

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    /// Check passed
    Pass,
    /// Check failed
    Fail,
    /// Check not run
    Skipped,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIP",
        })
    }
}

/// One named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoctorCheck {
    /// Check name
    pub name: &'static str,
    /// Outcome
    pub status: CheckStatus,
    /// What was found
    pub detail: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }

    fn skipped(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            detail: detail.into(),
        }
    }

    fn from_result(name: &'static str, result: Result<String, String>) -> Self {
        match result {
            Ok(detail) => Self::pass(name, detail),
            Err(detail) => Self::fail(name, detail),
        }
    }
}

/// Every check of one doctor run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DoctorReport {
    /// Checks in run order
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    /// True when no check failed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    /// Failed checks
    pub fn failures(&self) -> impl Iterator<Item = &DoctorCheck> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.checks {
            writeln!(f, "[{}] {:<16} {}", c.status, c.name, c.detail)?;
        }
        Ok(())
    }
}

async fn check_store(store: &Store) -> Result<String, String> {
    let pragma = store.pragma_status().await.map_err(|e| e.to_string())?;
    if pragma.journal_mode != "wal" {
        return Err(format!("journal_mode is {}", pragma.journal_mode));
    }
    if !pragma.foreign_keys {
        return Err("foreign_keys disabled".to_string());
    }
    let missing = store.missing_tables().await.map_err(|e| e.to_string())?;
    if !missing.is_empty() {
        return Err(format!("missing tables: {}", missing.join(", ")));
    }
    Ok(format!("wal, foreign_keys, busy_timeout {} ms", pragma.busy_timeout_ms))
}

async fn check_audit_dir(dir: &Path) -> Result<String, String> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| format!("{}: {e}", dir.display()))?;
    let marker = dir.join(".doctor-write-check");
    tokio::fs::write(&marker, b"ok").await.map_err(|e| format!("{}: {e}", marker.display()))?;
    tokio::fs::remove_file(&marker).await.map_err(|e| format!("{}: {e}", marker.display()))?;
    Ok(dir.display().to_string())
}

async fn check_disk(path: &Path, pause_bytes: u64) -> Result<String, String> {
    let owned = path.to_path_buf();
    let free = tokio::task::spawn_blocking(move || monitoring::disk_free_bytes(&owned))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
    if free <= pause_bytes {
        return Err(format!("{free} bytes free, need more than {pause_bytes}"));
    }
    Ok(format!("{free} bytes free"))
}

async fn check_exchange(exchange: &dyn ExchangeRest, clock: &dyn Clock, recv_window_ms: i64) -> Result<String, String> {
    exchange.ping().await.map_err(|e| format!("ping: {e}"))?;
    let server = exchange.server_time().await.map_err(|e| format!("server time: {e}"))?;
    let offset = server - clock.now_ms();
    if offset.abs() >= recv_window_ms {
        return Err(format!("clock offset {offset} ms exceeds recv window {recv_window_ms} ms"));
    }
    Ok(format!("reachable, clock offset {offset} ms"))
}

/// Run every check
///
/// A missing `store` or `exchange` skips the checks that need it.
pub async fn run_checks(
    cfg: &AgentConfig,
    store: Option<&Store>,
    exchange: Option<&dyn ExchangeRest>,
    clock: &dyn Clock,
) -> DoctorReport {
    let mut checks = vec![DoctorCheck::from_result(
        "config",
        cfg.validate().map(|()| "valid".to_string()).map_err(|e| e.to_string()),
    )];

    checks.push(match store {
        Some(store) => DoctorCheck::from_result("store", check_store(store).await),
        None => DoctorCheck::skipped("store", "not opened"),
    });
    checks.push(DoctorCheck::from_result("audit_dir", check_audit_dir(&cfg.audit.dir).await));

    let data_dir = cfg.runtime.db_path.parent().unwrap_or_else(|| Path::new("."));
    checks.push(DoctorCheck::from_result(
        "disk",
        check_disk(data_dir, cfg.health.disk_free_pause_bytes).await,
    ));

    checks.push(DoctorCheck::from_result(
        "prompt_assets",
        PromptAssets::load(cfg.aigate.prompt_dir.as_deref())
            .map(|_| "parsed".to_string())
            .map_err(|e| e.to_string()),
    ));

    checks.push(match exchange {
        Some(exchange) => DoctorCheck::from_result(
            "exchange",
            check_exchange(exchange, clock, cfg.exchange.time_sync_recv_window_ms).await,
        ),
        None => DoctorCheck::skipped("exchange", "offline"),
    });

    let report = DoctorReport { checks };
    for c in report.failures() {
        warn!(check = c.name, detail = %c.detail, "doctor check failed");
    }
    if report.passed() {
        info!(checks = report.checks.len(), "doctor checks passed");
    }
    report
}
