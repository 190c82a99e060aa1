//! Account state as seen by the risk engine
//!
//! Built once per cycle at STATE_UPDATE from the exchange balances, the open
//! orders and the latest book quotes.

use common::decimal::parse_decimal;
use common::model::Side;
use feeds::{Balance, BookTickerStore, RemoteOrder};
use risk_manager::{AccountState, SymbolPosition};
use rust_decimal::Decimal;
use tracing::warn;

use crate::reconcile::TrackedSymbol;

const DAY_MS: i64 = 86_400_000;

/// Equity at the start of the UTC day and the day's peak
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquityDay {
    day: Option<i64>,
    start: Decimal,
    peak: Decimal,
}

impl EquityDay {
    /// Fold in the equity observed at `now_ms`; returns `(start, peak)`
    pub fn observe(&mut self, equity: Decimal, now_ms: i64) -> (Decimal, Decimal) {
        let day = now_ms.div_euclid(DAY_MS);
        if self.day != Some(day) {
            self.day = Some(day);
            self.start = equity;
            self.peak = equity;
        }
        self.peak = self.peak.max(equity);
        (self.start, self.peak)
    }
}

fn amount(value: &str, what: &str, asset: &str) -> Decimal {
    parse_decimal(value).unwrap_or_else(|e| {
        warn!(asset, what, value, error = %e, "unparsable balance treated as zero");
        Decimal::ZERO
    })
}

/// Free plus locked amount of `asset`
#[must_use]
pub fn total_of(balances: &[Balance], asset: &str) -> Decimal {
    balances
        .iter()
        .filter(|b| b.asset == asset)
        .map(|b| amount(&b.free, "free", asset) + amount(&b.locked, "locked", asset))
        .sum()
}

/// Account state for the risk engine
///
/// Exposure is marked at the latest best bid of each tracked symbol. The
/// exchange reports `free` net of `locked`, so the quote total is carried
/// in `free_quote` and the locked part in `locked_quote`.
pub fn account_state(
    quote_asset: &str,
    balances: &[Balance],
    open_orders: &[RemoteOrder],
    tracked: &[TrackedSymbol],
    books: &BookTickerStore,
    equity_day: &mut EquityDay,
    now_ms: i64,
) -> AccountState {
    let mut state = AccountState::default();
    for b in balances.iter().filter(|b| b.asset == quote_asset) {
        let locked = amount(&b.locked, "locked", quote_asset);
        state.free_quote += amount(&b.free, "free", quote_asset) + locked;
        state.locked_quote += locked;
    }

    for t in tracked {
        let qty = total_of(balances, &t.base_asset);
        let latest = books.latest(&t.symbol);
        if let Some(sample) = &latest {
            state.ws_latency_ms = state
                .ws_latency_ms
                .max(sample.local_ts_ms - sample.exchange_ts_ms);
        }
        let bid = latest
            .and_then(|s| parse_decimal(&s.bid_price).ok())
            .unwrap_or(Decimal::ZERO);
        let entry_pending = open_orders
            .iter()
            .any(|o| o.symbol == t.symbol && o.side == Side::Buy && o.order_list_id < 0);
        let position = SymbolPosition {
            exposure: qty * bid,
            position_open: qty > Decimal::ZERO && qty >= t.min_qty,
            entry_pending,
        };
        if position == SymbolPosition::default() {
            continue;
        }
        state.total_exposure += position.exposure;
        state.positions.insert(t.symbol.clone(), position);
    }

    state.open_orders = u32::try_from(open_orders.len()).unwrap_or(u32::MAX);
    state.unfilled_orders = u32::try_from(
        open_orders
            .iter()
            .filter(|o| o.order_list_id < 0 && parse_decimal(&o.executed_qty).is_ok_and(|q| q.is_zero()))
            .count(),
    )
    .unwrap_or(u32::MAX);

    let equity_now = state.free_quote + state.total_exposure;
    let (start, peak) = equity_day.observe(equity_now, now_ms);
    state.start_equity = start;
    state.peak_equity = peak;
    state.unrealized_pnl = equity_now - start;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::BookSample;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    const NOW: i64 = 1_700_000_000_000;

    fn balance(asset: &str, free: &str, locked: &str) -> Balance {
        Balance {
            asset: asset.into(),
            free: free.into(),
            locked: locked.into(),
        }
    }

    fn order(cid: &str, side: Side, list: i64, executed: &str) -> RemoteOrder {
        RemoteOrder {
            symbol: "BTCUSDT".into(),
            order_id: "1".into(),
            client_order_id: cid.into(),
            side,
            status: "NEW".into(),
            price: "30000".into(),
            orig_qty: "0.01".into(),
            executed_qty: executed.into(),
            order_list_id: list,
            time_ms: NOW,
        }
    }

    fn tracked() -> Vec<TrackedSymbol> {
        vec![TrackedSymbol {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            min_qty: dec!(0.001),
        }]
    }

    fn books() -> BookTickerStore {
        let books = BookTickerStore::new(120_000);
        books.push(
            "BTCUSDT",
            BookSample {
                exchange_ts_ms: NOW - 250,
                local_ts_ms: NOW,
                bid_price: "30000".into(),
                bid_qty: "1".into(),
                ask_price: "30001".into(),
                ask_qty: "1".into(),
            },
        );
        books
    }

    #[test]
    fn test_position_marked_at_best_bid() {
        let balances = [balance("USDT", "900", "100"), balance("BTC", "0.01", "0")];
        let mut day = EquityDay::default();
        let state = account_state("USDT", &balances, &[], &tracked(), &books(), &mut day, NOW);

        assert_eq!(state.free_quote, dec!(1000));
        assert_eq!(state.locked_quote, dec!(100));
        assert_eq!(state.available_quote(), dec!(900));
        let pos = &state.positions["BTCUSDT"];
        assert_eq!(pos.exposure, dec!(300));
        assert!(pos.position_open);
        assert!(!pos.entry_pending);
        assert_eq!(state.total_exposure, dec!(300));
        assert_eq!(state.ws_latency_ms, 250);
        assert_eq!(state.start_equity, dec!(1300));
    }

    #[test]
    fn test_open_buy_marks_entry_pending_and_unfilled() {
        let balances = [balance("USDT", "700", "300")];
        let orders = [
            order("E1", Side::Buy, -1, "0"),
            order("P1", Side::Sell, 7, "0"),
            order("P2", Side::Sell, 7, "0"),
        ];
        let mut day = EquityDay::default();
        let state = account_state("USDT", &balances, &orders, &tracked(), &books(), &mut day, NOW);

        assert!(state.positions["BTCUSDT"].entry_pending);
        assert!(!state.positions["BTCUSDT"].position_open);
        assert_eq!(state.open_orders, 3);
        assert_eq!(state.unfilled_orders, 1);
    }

    #[test]
    fn test_dust_below_min_qty_is_not_a_position() {
        let balances = [balance("USDT", "100", "0"), balance("BTC", "0.0001", "0")];
        let mut day = EquityDay::default();
        let state = account_state("USDT", &balances, &[], &tracked(), &books(), &mut day, NOW);
        assert!(!state.positions["BTCUSDT"].position_open);
    }

    #[test]
    fn test_equity_day_resets_at_utc_midnight() {
        let mut day = EquityDay::default();
        let midnight = 19_700 * DAY_MS;
        assert_eq!(day.observe(dec!(100), midnight + 10), (dec!(100), dec!(100)));
        assert_eq!(day.observe(dec!(120), midnight + 20), (dec!(100), dec!(120)));
        assert_eq!(day.observe(dec!(90), midnight + 30), (dec!(100), dec!(120)));
        assert_eq!(day.observe(dec!(95), midnight + DAY_MS), (dec!(95), dec!(95)));
    }
}
