//! Per-symbol best bid/ask history fed by the book-ticker stream
//!
//! Samples are kept in exchange-time order for the snapshot builder's micro
//! window. Events arriving more than [`OUT_OF_ORDER_TOLERANCE_MS`] behind the
//! newest exchange time of their symbol are dropped and counted per symbol.

use common::model::BookSample;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::trace;

/// Maximum lag behind the newest exchange time before a sample is dropped
pub const OUT_OF_ORDER_TOLERANCE_MS: i64 = 5_000;

#[derive(Debug, Default)]
struct SymbolBook {
    samples: VecDeque<BookSample>,
    newest_exchange_ms: i64,
    ooo_drops: u64,
}

/// Shared store of recent book-ticker samples
#[derive(Debug)]
pub struct BookTickerStore {
    books: Mutex<FxHashMap<String, Arc<Mutex<SymbolBook>>>>,
    retention_ms: i64,
    last_message_ms: AtomicI64,
}

impl BookTickerStore {
    /// Keep at least `retention_ms` of history per symbol
    #[must_use]
    pub fn new(retention_ms: i64) -> Self {
        Self {
            books: Mutex::new(FxHashMap::default()),
            retention_ms: retention_ms.max(1),
            last_message_ms: AtomicI64::new(0),
        }
    }

    fn book(&self, symbol: &str) -> Arc<Mutex<SymbolBook>> {
        let mut books = self.books.lock();
        Arc::clone(books.entry(symbol.to_string()).or_default())
    }

    /// Insert a sample; returns `false` when it was dropped as out of order
    pub fn push(&self, symbol: &str, sample: BookSample) -> bool {
        self.last_message_ms.fetch_max(sample.local_ts_ms, Ordering::Relaxed);
        let book = self.book(symbol);
        let mut book = book.lock();

        if sample.exchange_ts_ms < book.newest_exchange_ms - OUT_OF_ORDER_TOLERANCE_MS {
            book.ooo_drops += 1;
            trace!(symbol, exchange_ts_ms = sample.exchange_ts_ms, "dropping out-of-order book sample");
            return false;
        }

        // Keep exchange-time order for late but tolerated samples
        let pos = book
            .samples
            .iter()
            .rposition(|s| s.exchange_ts_ms <= sample.exchange_ts_ms)
            .map_or(0, |i| i + 1);
        book.newest_exchange_ms = book.newest_exchange_ms.max(sample.exchange_ts_ms);
        book.samples.insert(pos, sample);

        let horizon = book.newest_exchange_ms - self.retention_ms;
        while book.samples.front().is_some_and(|s| s.exchange_ts_ms < horizon) {
            book.samples.pop_front();
        }
        true
    }

    /// Samples with exchange time in `(to_ms - window_ms, to_ms]`, oldest first
    #[must_use]
    pub fn window(&self, symbol: &str, to_ms: i64, window_ms: i64) -> Vec<BookSample> {
        let Some(book) = self.books.lock().get(symbol).cloned() else {
            return Vec::new();
        };
        let book = book.lock();
        book.samples
            .iter()
            .filter(|s| s.exchange_ts_ms > to_ms - window_ms && s.exchange_ts_ms <= to_ms)
            .cloned()
            .collect()
    }

    /// Newest sample for the symbol
    #[must_use]
    pub fn latest(&self, symbol: &str) -> Option<BookSample> {
        let book = self.books.lock().get(symbol).cloned()?;
        let book = book.lock();
        book.samples.back().cloned()
    }

    /// Samples of `symbol` dropped as out of order since start
    #[must_use]
    pub fn ooo_drops(&self, symbol: &str) -> u64 {
        self.books.lock().get(symbol).map_or(0, |book| book.lock().ooo_drops)
    }

    /// Local receive time of the newest message across all symbols
    #[must_use]
    pub fn last_message_ms(&self) -> Option<i64> {
        match self.last_message_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Symbols with at least one sample
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.books.lock().keys().cloned().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(exchange_ts_ms: i64, bid: &str) -> BookSample {
        BookSample {
            exchange_ts_ms,
            local_ts_ms: exchange_ts_ms + 3,
            bid_price: bid.into(),
            bid_qty: "1".into(),
            ask_price: "100.10".into(),
            ask_qty: "1".into(),
        }
    }

    #[test]
    fn test_out_of_order_beyond_tolerance_is_dropped() {
        let store = BookTickerStore::new(60_000);
        assert!(store.push("BTCUSDT", sample(10_000, "100.00")));
        assert!(store.push("BTCUSDT", sample(5_000, "99.00")), "exactly at tolerance is kept");
        assert!(!store.push("BTCUSDT", sample(4_999, "98.00")));
        assert_eq!(store.ooo_drops("BTCUSDT"), 1);

        let w = store.window("BTCUSDT", 10_000, 10_000);
        assert_eq!(w.iter().map(|s| s.exchange_ts_ms).collect::<Vec<_>>(), [5_000, 10_000]);
        assert_eq!(store.latest("BTCUSDT").unwrap().bid_price, "100.00");
    }

    #[test]
    fn test_drops_count_against_their_own_symbol() {
        let store = BookTickerStore::new(60_000);
        assert!(store.push("BTCUSDT", sample(10_000, "100.00")));
        assert!(store.push("ETHUSDT", sample(10_000, "2000.00")));
        assert!(!store.push("ETHUSDT", sample(1_000, "1990.00")));

        assert_eq!(store.ooo_drops("ETHUSDT"), 1);
        assert_eq!(store.ooo_drops("BTCUSDT"), 0);
        assert_eq!(store.ooo_drops("XRPUSDT"), 0);
        // an old sample for a fresh symbol is its first, not a late one
        assert!(store.push("SOLUSDT", sample(1_000, "20.00")));
    }

    #[test]
    fn test_retention_trims_old_samples() {
        let store = BookTickerStore::new(1_000);
        for t in (0..=3_000).step_by(500) {
            store.push("ETHUSDT", sample(t, "1"));
        }
        let all = store.window("ETHUSDT", 3_000, 10_000);
        assert_eq!(all.first().unwrap().exchange_ts_ms, 2_000);
        assert_eq!(store.last_message_ms(), Some(3_003));
        assert!(store.window("XRPUSDT", 3_000, 10_000).is_empty());
    }
}
