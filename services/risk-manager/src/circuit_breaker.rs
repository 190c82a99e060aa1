//! Per-symbol loss breaker
//!
//! Counts consecutive losing exits and holds a cooldown deadline after each
//! loss. A winning exit resets the streak but leaves any running cooldown.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// Loss streak and cooldown for one symbol
#[derive(Debug, Default)]
pub struct LossBreaker {
    consecutive_losses: AtomicU32,
    cooldown_until_ms: AtomicI64,
}

impl LossBreaker {
    /// Fresh breaker with no history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Losing exit at `now_ms`; starts (or extends) the cooldown
    pub fn record_loss(&self, now_ms: i64, cooldown_ms: i64) {
        self.consecutive_losses.fetch_add(1, Ordering::Relaxed);
        let until = now_ms.saturating_add(cooldown_ms.max(0));
        self.cooldown_until_ms.fetch_max(until, Ordering::Relaxed);
    }

    /// Flat or winning exit
    pub fn record_win(&self) {
        self.consecutive_losses.store(0, Ordering::Relaxed);
    }

    /// Current loss streak
    #[must_use]
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses.load(Ordering::Relaxed)
    }

    /// Cooldown deadline, 0 when none was ever set
    #[must_use]
    pub fn cooldown_until_ms(&self) -> i64 {
        self.cooldown_until_ms.load(Ordering::Relaxed)
    }

    /// Whether new entries are held back at `now_ms`
    #[must_use]
    pub fn is_cooling(&self, now_ms: i64) -> bool {
        now_ms < self.cooldown_until_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_starts_cooldown() {
        let b = LossBreaker::new();
        assert!(!b.is_cooling(0));
        b.record_loss(1_000, 500);
        assert!(b.is_cooling(1_499));
        assert!(!b.is_cooling(1_500));
        assert_eq!(b.consecutive_losses(), 1);
    }

    #[test]
    fn test_win_resets_streak_not_cooldown() {
        let b = LossBreaker::new();
        b.record_loss(1_000, 500);
        b.record_loss(1_100, 500);
        assert_eq!(b.consecutive_losses(), 2);
        b.record_win();
        assert_eq!(b.consecutive_losses(), 0);
        assert_eq!(b.cooldown_until_ms(), 1_600);
    }

    #[test]
    fn test_earlier_loss_does_not_shorten_cooldown() {
        let b = LossBreaker::new();
        b.record_loss(5_000, 1_000);
        b.record_loss(4_000, 1_000);
        assert_eq!(b.cooldown_until_ms(), 6_000);
    }
}
