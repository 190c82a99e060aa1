//! Request-weight and order-count limiter
//!
//! Mirrors the exchange's fixed windows: request weight per minute and order
//! count per ten seconds, both aligned to wall-clock boundaries. Response
//! headers report the exchange's own count and override the local one.

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::debug;

/// Header carrying used request weight in the current minute
pub const HEADER_USED_WEIGHT_1M: &str = "x-mbx-used-weight-1m";
/// Header carrying orders placed in the current ten seconds
pub const HEADER_ORDER_COUNT_10S: &str = "x-mbx-order-count-10s";

const MINUTE_MS: i64 = 60_000;
const TEN_SECONDS_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    len_ms: i64,
    limit: u32,
    start_ms: i64,
    used: u32,
}

impl Window {
    const fn new(len_ms: i64, limit: u32) -> Self {
        Self {
            len_ms,
            limit,
            start_ms: 0,
            used: 0,
        }
    }

    fn roll(&mut self, now_ms: i64) {
        let start = now_ms - now_ms.rem_euclid(self.len_ms);
        if start != self.start_ms {
            self.start_ms = start;
            self.used = 0;
        }
    }

    fn delay(&self, now_ms: i64, cost: u32) -> i64 {
        if cost == 0 || self.used.saturating_add(cost) <= self.limit {
            0
        } else {
            (self.start_ms + self.len_ms - now_ms).max(1)
        }
    }
}

#[derive(Debug)]
struct Windows {
    weight: Window,
    orders: Window,
}

/// Shared limiter for every REST call of one API key
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<Windows>,
}

impl RateLimiter {
    /// Limiter with the given per-minute weight and per-ten-second order budgets
    #[must_use]
    pub fn new(weight_limit_1m: u32, order_limit_10s: u32) -> Self {
        Self {
            inner: Mutex::new(Windows {
                weight: Window::new(MINUTE_MS, weight_limit_1m),
                orders: Window::new(TEN_SECONDS_MS, order_limit_10s),
            }),
        }
    }

    /// Minimum delay before a call of `weight` may go out; a zero delay
    /// reserves the weight
    pub fn wait(&self, now_ms: i64, weight: u32) -> Duration {
        self.reserve(now_ms, weight, 0)
    }

    /// As [`RateLimiter::wait`] for a call that also places an order
    pub fn wait_order(&self, now_ms: i64, weight: u32) -> Duration {
        self.reserve(now_ms, weight, 1)
    }

    fn reserve(&self, now_ms: i64, weight: u32, orders: u32) -> Duration {
        let mut w = self.inner.lock();
        w.weight.roll(now_ms);
        w.orders.roll(now_ms);
        let delay = w.weight.delay(now_ms, weight).max(w.orders.delay(now_ms, orders));
        if delay == 0 {
            w.weight.used = w.weight.used.saturating_add(weight);
            w.orders.used = w.orders.used.saturating_add(orders);
            Duration::ZERO
        } else {
            debug!(delay_ms = delay, used_weight = w.weight.used, "rate limiter delaying call");
            Duration::from_millis(u64::try_from(delay).unwrap_or(0))
        }
    }

    /// Adopt the exchange-reported usage for the current windows
    pub fn update_from_headers(&self, now_ms: i64, headers: &HeaderMap) {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok())
        };
        self.update_usage(now_ms, read(HEADER_USED_WEIGHT_1M), read(HEADER_ORDER_COUNT_10S));
    }

    /// Adopt reported usage; values are clamped to the configured limits
    pub fn update_usage(&self, now_ms: i64, used_weight: Option<u32>, order_count: Option<u32>) {
        let mut w = self.inner.lock();
        w.weight.roll(now_ms);
        w.orders.roll(now_ms);
        if let Some(used) = used_weight {
            w.weight.used = used.min(w.weight.limit);
        }
        if let Some(count) = order_count {
            w.orders.used = count.min(w.orders.limit);
        }
    }

    /// Weight and orders used in the current windows
    #[must_use]
    pub fn usage(&self, now_ms: i64) -> (u32, u32) {
        let mut w = self.inner.lock();
        w.weight.roll(now_ms);
        w.orders.roll(now_ms);
        (w.weight.used, w.orders.used)
    }
}
