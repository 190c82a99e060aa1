//! Trading activity counters
//!
//! Rolling counts the risk gate needs and the exchange does not report:
//! entries per window and per UTC day, entry churn, cancel-replaces,
//! order rejects and the per-symbol loss breaker. All timestamps are
//! caller-supplied epoch milliseconds.

use crate::circuit_breaker::LossBreaker;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// One hour in milliseconds
pub const HOUR_MS: i64 = 3_600_000;
/// One day in milliseconds
pub const DAY_MS: i64 = 86_400_000;

/// Per-symbol activity
#[derive(Debug, Default)]
struct SymbolActivity {
    cancel_replaces: Mutex<VecDeque<i64>>,
    churn: Mutex<VecDeque<i64>>,
    rejects: Mutex<VecDeque<i64>>,
    breaker: LossBreaker,
}

/// Counts observed at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityCounts {
    /// Entries inside the rolling trade window (all symbols)
    pub trades_in_window: u32,
    /// Entries since UTC midnight (all symbols)
    pub trades_today: u32,
    /// Losing exits in a row for the symbol
    pub consecutive_losses: u32,
    /// Cooldown deadline for the symbol
    pub cooldown_until_ms: i64,
    /// Entries cancelled unfilled in the last hour
    pub churn_last_hour: u32,
    /// Cancel-replaces in the last hour
    pub cancel_replace_last_hour: u32,
    /// Exchange rejects in the last hour
    pub rejects_last_hour: u32,
}

/// Activity tracker shared between the executor and the risk gate
#[derive(Debug)]
pub struct ActivityMonitor {
    trades_window_ms: i64,
    entries: Mutex<VecDeque<i64>>,
    symbols: DashMap<String, Arc<SymbolActivity>>,
}

fn push(q: &Mutex<VecDeque<i64>>, now_ms: i64, keep_ms: i64) {
    let mut q = q.lock();
    q.push_back(now_ms);
    let cutoff = now_ms.saturating_sub(keep_ms);
    while q.front().is_some_and(|&ts| ts <= cutoff) {
        q.pop_front();
    }
}

fn count_since(q: &Mutex<VecDeque<i64>>, since_ms: i64) -> u32 {
    let n = q.lock().iter().filter(|&&ts| ts > since_ms).count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn utc_midnight(now_ms: i64) -> i64 {
    now_ms - now_ms.rem_euclid(DAY_MS)
}

impl ActivityMonitor {
    /// Tracker with the given rolling trade window
    #[must_use]
    pub fn new(trades_window_ms: i64) -> Self {
        Self {
            trades_window_ms,
            entries: Mutex::new(VecDeque::with_capacity(64)),
            symbols: DashMap::new(),
        }
    }

    fn symbol(&self, symbol: &str) -> Arc<SymbolActivity> {
        if let Some(a) = self.symbols.get(symbol) {
            return Arc::clone(&a);
        }
        Arc::clone(&self.symbols.entry(symbol.to_string()).or_default())
    }

    fn keep_ms(&self) -> i64 {
        self.trades_window_ms.max(DAY_MS)
    }

    /// Entry order confirmed by the exchange
    pub fn record_entry(&self, symbol: &str, now_ms: i64) {
        push(&self.entries, now_ms, self.keep_ms());
        debug!(symbol, now_ms, "entry recorded");
    }

    /// Position closed; a negative `pnl` counts as a loss and starts the cooldown
    pub fn record_exit(&self, symbol: &str, pnl: Decimal, now_ms: i64, cooldown_ms: i64) {
        let a = self.symbol(symbol);
        if pnl.is_sign_negative() && !pnl.is_zero() {
            a.breaker.record_loss(now_ms, cooldown_ms);
            debug!(symbol, %pnl, streak = a.breaker.consecutive_losses(), "losing exit");
        } else {
            a.breaker.record_win();
        }
    }

    /// Entry cancelled without a fill
    pub fn record_churn(&self, symbol: &str, now_ms: i64) {
        push(&self.symbol(symbol).churn, now_ms, HOUR_MS);
    }

    /// Maker entry cancelled and re-placed
    pub fn record_cancel_replace(&self, symbol: &str, now_ms: i64) {
        push(&self.symbol(symbol).cancel_replaces, now_ms, HOUR_MS);
    }

    /// Exchange rejected an order for the symbol
    pub fn record_reject(&self, symbol: &str, now_ms: i64) {
        push(&self.symbol(symbol).rejects, now_ms, HOUR_MS);
    }

    /// Time at which `symbol` leaves reject quarantine, `0` when not quarantined
    ///
    /// A symbol is quarantined while it has at least `max_rejects_per_hour`
    /// rejects in the trailing hour; the quarantine lifts once enough of them
    /// age out to bring the count below the cap.
    #[must_use]
    pub fn quarantine_until_ms(&self, symbol: &str, now_ms: i64, max_rejects_per_hour: u32) -> i64 {
        let cap = usize::try_from(max_rejects_per_hour).unwrap_or(usize::MAX);
        if cap == 0 {
            return 0;
        }
        let Some(a) = self.symbols.get(symbol) else {
            return 0;
        };
        let hour_ago = now_ms.saturating_sub(HOUR_MS);
        let rejects = a.rejects.lock();
        let recent: Vec<i64> = rejects.iter().copied().filter(|&ts| ts > hour_ago).collect();
        if recent.len() < cap {
            return 0;
        }
        recent[recent.len() - cap].saturating_add(HOUR_MS)
    }

    /// Counts for `symbol` as of `now_ms`
    #[must_use]
    pub fn counts(&self, symbol: &str, now_ms: i64) -> ActivityCounts {
        let hour_ago = now_ms.saturating_sub(HOUR_MS);
        let mut c = ActivityCounts {
            trades_in_window: count_since(&self.entries, now_ms.saturating_sub(self.trades_window_ms)),
            trades_today: count_since(&self.entries, utc_midnight(now_ms) - 1),
            ..ActivityCounts::default()
        };
        if let Some(a) = self.symbols.get(symbol) {
            c.consecutive_losses = a.breaker.consecutive_losses();
            c.cooldown_until_ms = a.breaker.cooldown_until_ms();
            c.churn_last_hour = count_since(&a.churn, hour_ago);
            c.cancel_replace_last_hour = count_since(&a.cancel_replaces, hour_ago);
            c.rejects_last_hour = count_since(&a.rejects, hour_ago);
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MIDNIGHT: i64 = 1_700_006_400_000;

    #[test]
    fn test_window_and_day_counts() {
        let m = ActivityMonitor::new(HOUR_MS);
        m.record_entry("BTCUSDT", MIDNIGHT - 1_000);
        m.record_entry("ETHUSDT", MIDNIGHT + 1_000);

        let c = m.counts("BTCUSDT", MIDNIGHT + 10_000);
        assert_eq!(c.trades_in_window, 2);
        assert_eq!(c.trades_today, 1);

        m.record_entry("BTCUSDT", MIDNIGHT + 2 * HOUR_MS);
        let c = m.counts("BTCUSDT", MIDNIGHT + 2 * HOUR_MS + 10);
        assert_eq!(c.trades_in_window, 1);
        assert_eq!(c.trades_today, 2);
    }

    #[test]
    fn test_hourly_counters_expire() {
        let m = ActivityMonitor::new(HOUR_MS);
        m.record_cancel_replace("BTCUSDT", 1_000);
        m.record_churn("BTCUSDT", 1_000);
        m.record_reject("BTCUSDT", 2_000);
        let c = m.counts("BTCUSDT", 3_000);
        assert_eq!((c.cancel_replace_last_hour, c.churn_last_hour, c.rejects_last_hour), (1, 1, 1));

        let c = m.counts("BTCUSDT", 1_000 + HOUR_MS);
        assert_eq!((c.cancel_replace_last_hour, c.churn_last_hour, c.rejects_last_hour), (0, 0, 1));
        assert_eq!(m.counts("ETHUSDT", 3_000), ActivityCounts::default());
    }

    #[test]
    fn test_reject_cap_quarantines_until_oldest_ages_out() {
        let m = ActivityMonitor::new(HOUR_MS);
        m.record_reject("BTCUSDT", 1_000);
        m.record_reject("BTCUSDT", 2_000);
        assert_eq!(m.quarantine_until_ms("BTCUSDT", 3_000, 3), 0);

        m.record_reject("BTCUSDT", 5_000);
        assert_eq!(m.quarantine_until_ms("BTCUSDT", 6_000, 3), 1_000 + HOUR_MS);
        assert_eq!(m.quarantine_until_ms("BTCUSDT", 6_000, 2), 2_000 + HOUR_MS);
        assert_eq!(m.quarantine_until_ms("BTCUSDT", 1_000 + HOUR_MS, 3), 0);
        assert_eq!(m.quarantine_until_ms("ETHUSDT", 6_000, 3), 0);
        assert_eq!(m.quarantine_until_ms("BTCUSDT", 6_000, 0), 0);
    }

    #[test]
    fn test_losses_drive_breaker() {
        let m = ActivityMonitor::new(HOUR_MS);
        m.record_exit("BTCUSDT", dec!(-1.5), 10_000, 900_000);
        m.record_exit("BTCUSDT", dec!(-0.2), 20_000, 900_000);
        let c = m.counts("BTCUSDT", 30_000);
        assert_eq!(c.consecutive_losses, 2);
        assert_eq!(c.cooldown_until_ms, 920_000);

        m.record_exit("BTCUSDT", Decimal::ZERO, 40_000, 900_000);
        assert_eq!(m.counts("BTCUSDT", 50_000).consecutive_losses, 0);
    }
}
