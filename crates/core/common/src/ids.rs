//! Clocks, correlation ids and exchange acknowledgement ids
//!
//! Time and randomness are injected so cycle ids, audit envelopes and
//! staleness checks can be pinned in tests.

use crate::error::{CommonError, CommonResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Millisecond wall clock
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// Real system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Test clock advanced by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock pinned at `now_ms`
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    /// Move to an absolute time
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `delta_ms`
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Source of 24-bit nonces for correlation ids
pub trait NonceSource: Send + Sync {
    /// Next nonce in `0..0x1000000`
    fn next_nonce(&self) -> u32;
}

/// Thread-local RNG nonces
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngNonce;

impl NonceSource for ThreadRngNonce {
    fn next_nonce(&self) -> u32 {
        rand::thread_rng().gen_range(0..0x100_0000)
    }
}

/// Deterministic nonces for tests: 0, 1, 2, ...
#[derive(Debug, Default)]
pub struct SequentialNonce {
    next: AtomicU64,
}

impl NonceSource for SequentialNonce {
    fn next_nonce(&self) -> u32 {
        (self.next.fetch_add(1, Ordering::Relaxed) & 0xff_ffff) as u32
    }
}

/// `{prefix}_YYYYMMDD_HHMMSS_xxxxxx` from a clock reading and a nonce
pub fn correlation_id(prefix: &str, now_ms: i64, nonce: u32) -> CommonResult<String> {
    let ts = DateTime::<Utc>::from_timestamp_millis(now_ms)
        .ok_or(CommonError::InvalidTimestamp(now_ms))?;
    Ok(format!(
        "{prefix}_{}_{:06x}",
        ts.format("%Y%m%d_%H%M%S"),
        nonce & 0xff_ffff
    ))
}

/// New cycle id
pub fn new_cycle_id(clock: &dyn Clock, nonces: &dyn NonceSource) -> CommonResult<String> {
    correlation_id("cyc", clock.now_ms(), nonces.next_nonce())
}

/// New run id, issued once per process
pub fn new_run_id(clock: &dyn Clock, nonces: &dyn NonceSource) -> CommonResult<String> {
    correlation_id("run", clock.now_ms(), nonces.next_nonce())
}

/// `^[A-Za-z0-9_-]+$`
#[must_use]
pub fn is_valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Validate a correlation id field
pub fn validate_correlation_id(field: &str, id: &str) -> CommonResult<()> {
    if is_valid_correlation_id(id) {
        Ok(())
    } else {
        Err(CommonError::schema(field, format!("invalid correlation id {id:?}")))
    }
}

/// Length of every exchange-facing client order id
pub const CLIENT_ORDER_ID_LEN: usize = 36;

/// Suffixes for protective variants of an entry intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentVariant {
    /// Take-profit leg
    TakeProfit,
    /// Stop-loss leg
    StopLoss,
    /// OCO list
    Oco,
}

impl IntentVariant {
    /// Suffix appended to the parent intent id
    #[must_use]
    pub const fn suffix(&self) -> &'static str {
        match self {
            Self::TakeProfit => "_TP",
            Self::StopLoss => "_SL",
            Self::Oco => "_OCO",
        }
    }

    /// Derived intent id for this variant
    #[must_use]
    pub fn intent_id(&self, parent: &str) -> String {
        format!("{parent}{}", self.suffix())
    }
}

/// `"X_" + base32_nopad(sha256(intent_id))[..34]`
#[must_use]
pub fn client_order_id(intent_id: &str) -> String {
    let digest = Sha256::digest(intent_id.as_bytes());
    let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &digest);
    format!("X_{}", &encoded[..34])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_id_format() {
        // 2024-01-02T03:04:05Z
        let clock = ManualClock::new(1_704_164_645_000);
        let id = correlation_id("cyc", clock.now_ms(), 0xabc).unwrap();
        assert_eq!(id, "cyc_20240102_030405_000abc");
        assert!(is_valid_correlation_id(&id));
    }

    #[test]
    fn test_nonce_is_masked_to_six_hex() {
        let id = correlation_id("run", 0, 0xffff_ffff).unwrap();
        assert!(id.ends_with("_ffffff"));
    }

    #[test]
    fn test_invalid_ids() {
        assert!(!is_valid_correlation_id(""));
        assert!(!is_valid_correlation_id("cyc 1"));
        assert!(!is_valid_correlation_id("cyc/1"));
        assert!(validate_correlation_id("cycle_id", "a-b_C9").is_ok());
    }

    #[test]
    fn test_client_order_id_is_stable_and_36_chars() {
        let a = client_order_id("oi_abc");
        let b = client_order_id("oi_abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), CLIENT_ORDER_ID_LEN);
        assert!(a.starts_with("X_"));
        assert_ne!(a, client_order_id(&IntentVariant::TakeProfit.intent_id("oi_abc")));
        assert_eq!(IntentVariant::Oco.intent_id("oi_x"), "oi_x_OCO");
    }

    #[test]
    fn test_thread_rng_nonce_in_range() {
        let n = ThreadRngNonce;
        for _ in 0..100 {
            assert!(n.next_nonce() < 0x100_0000);
        }
    }
}
