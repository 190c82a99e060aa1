//! Indicator math on candle and book series
//!
//! Floats are confined to this module and the scores derived from it; every
//! result that leaves as a snapshot field is rounded half to even into an
//! integer first.

use common::model::Candle;

/// Round half to even into an `i64`; non-finite input yields 0
#[must_use]
pub fn round_even(x: f64) -> i64 {
    let r = x.round_ties_even();
    if !r.is_finite() {
        return 0;
    }
    // Saturating float-to-int cast
    r as i64
}

/// `round_even(value / reference * 10000)`; 0 for a non-positive reference
#[must_use]
pub fn to_bps(value: f64, reference: f64) -> i64 {
    if reference <= 0.0 {
        return 0;
    }
    round_even(value / reference * 10_000.0)
}

fn true_range(prev_close: f64, c: &Candle) -> f64 {
    let (h, l) = (c.high_f64(), c.low_f64());
    (h - l).max((h - prev_close).abs()).max((l - prev_close).abs())
}

/// Wilder-smoothed average true range
///
/// Needs at least `period + 1` bars.
#[must_use]
pub fn wilder_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let tr: Vec<f64> = candles
        .windows(2)
        .map(|w| true_range(w[0].close_f64(), &w[1]))
        .collect();
    let p = period as f64;
    let mut atr = tr[..period].iter().sum::<f64>() / p;
    for v in &tr[period..] {
        atr = (atr * (p - 1.0) + v) / p;
    }
    Some(atr)
}

/// ATR-14 of `candles` in bps of the last close
#[must_use]
pub fn atr_bps(candles: &[Candle], period: usize) -> Option<i64> {
    let atr = wilder_atr(candles, period)?;
    let last = candles.last()?.close_f64();
    Some(to_bps(atr, last))
}

/// Wilder average directional index in [0, 100]
///
/// Needs at least `2 * period` bars: `period` moves to seed the smoothed
/// directional sums, then `period` DX values to seed the ADX.
#[must_use]
pub fn wilder_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period {
        return None;
    }
    let p = period as f64;
    let mut tr = Vec::with_capacity(candles.len() - 1);
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    for w in candles.windows(2) {
        let up = w[1].high_f64() - w[0].high_f64();
        let down = w[0].low_f64() - w[1].low_f64();
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        tr.push(true_range(w[0].close_f64(), &w[1]));
    }

    let mut s_tr: f64 = tr[..period].iter().sum();
    let mut s_plus: f64 = plus_dm[..period].iter().sum();
    let mut s_minus: f64 = minus_dm[..period].iter().sum();
    let dx = |s_tr: f64, s_plus: f64, s_minus: f64| -> f64 {
        if s_tr <= 0.0 {
            return 0.0;
        }
        let di_plus = 100.0 * s_plus / s_tr;
        let di_minus = 100.0 * s_minus / s_tr;
        let sum = di_plus + di_minus;
        if sum <= 0.0 { 0.0 } else { 100.0 * (di_plus - di_minus).abs() / sum }
    };

    let mut dxs = vec![dx(s_tr, s_plus, s_minus)];
    for i in period..tr.len() {
        s_tr = s_tr - s_tr / p + tr[i];
        s_plus = s_plus - s_plus / p + plus_dm[i];
        s_minus = s_minus - s_minus / p + minus_dm[i];
        dxs.push(dx(s_tr, s_plus, s_minus));
    }
    if dxs.len() < period {
        return None;
    }
    let mut adx = dxs[..period].iter().sum::<f64>() / p;
    for v in &dxs[period..] {
        adx = (adx * (p - 1.0) + v) / p;
    }
    Some(adx.clamp(0.0, 100.0))
}

/// Exponential moving average seeded with the simple mean of the first `period` values
#[must_use]
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut e = values[..period].iter().sum::<f64>() / period as f64;
    for v in &values[period..] {
        e = alpha * v + (1.0 - alpha) * e;
    }
    Some(e)
}

/// Nearest-rank percentile of integer samples; `None` when empty
#[must_use]
pub fn percentile(values: &[i64], pct: u32) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let rank = (u64::from(pct.min(100)) * n as u64).div_ceil(100) as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

/// Pearson correlation; `None` for fewer than two points or a flat series
#[must_use]
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);
    let nf = n as f64;
    let mean_a = a.iter().sum::<f64>() / nf;
    let mean_b = b.iter().sum::<f64>() / nf;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

/// Log-returns in bps of the last `window_points + 1` closes
///
/// Returns the series and the number of points zero-filled because a close
/// was non-positive. `None` if there are not enough closes.
#[must_use]
pub fn log_returns_bps(closes: &[f64], window_points: usize) -> Option<(Vec<i32>, usize)> {
    if closes.len() < window_points + 1 {
        return None;
    }
    let tail = &closes[closes.len() - window_points - 1..];
    let mut missing = 0;
    let series = tail
        .windows(2)
        .map(|w| {
            if w[0] <= 0.0 || w[1] <= 0.0 {
                missing += 1;
                0
            } else {
                let bps = round_even((w[1] / w[0]).ln() * 10_000.0);
                i32::try_from(bps).unwrap_or(if bps > 0 { i32::MAX } else { i32::MIN })
            }
        })
        .collect();
    Some((series, missing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bar(t: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            open_time_ms: t,
            open: format!("{o}"),
            high: format!("{h}"),
            low: format!("{l}"),
            close: format!("{c}"),
            volume: "1".into(),
        }
    }

    #[test]
    fn test_round_even_ties() {
        assert_eq!(round_even(2.5), 2);
        assert_eq!(round_even(3.5), 4);
        assert_eq!(round_even(-2.5), -2);
        assert_eq!(round_even(f64::NAN), 0);
    }

    #[test]
    fn test_constant_range_atr() {
        // Every bar spans exactly 2.0 around a flat close of 100
        let candles: Vec<Candle> = (0..20).map(|i| bar(i, 100.0, 101.0, 99.0, 100.0)).collect();
        let atr = wilder_atr(&candles, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-12);
        assert_eq!(atr_bps(&candles, 14), Some(200));
        assert!(wilder_atr(&candles[..14], 14).is_none());
    }

    #[test]
    fn test_adx_strong_trend_vs_chop() {
        let trend: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + f64::from(i);
                bar(i64::from(i), base, base + 0.8, base - 0.2, base + 0.6)
            })
            .collect();
        let chop: Vec<Candle> = (0..40)
            .map(|i| {
                let up = i % 2 == 0;
                let (h, l) = if up { (101.0, 99.5) } else { (100.5, 99.0) };
                bar(i64::from(i), 100.0, h, l, 100.0)
            })
            .collect();
        let adx_trend = wilder_adx(&trend, 14).unwrap();
        let adx_chop = wilder_adx(&chop, 14).unwrap();
        assert!(adx_trend > 90.0, "trend adx {adx_trend}");
        assert!(adx_chop < 20.0, "chop adx {adx_chop}");
        assert!(wilder_adx(&trend[..27], 14).is_none());
    }

    #[test]
    fn test_ema_of_constant_is_constant() {
        assert_eq!(ema(&[5.0; 30], 20), Some(5.0));
        assert!(ema(&[1.0; 5], 20).is_none());
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let v = [5, 1, 4, 2, 3];
        assert_eq!(percentile(&v, 50), Some(3));
        assert_eq!(percentile(&v, 90), Some(5));
        assert_eq!(percentile(&v, 0), Some(1));
        assert_eq!(percentile(&[], 50), None);
    }

    #[test]
    fn test_log_returns_zero_fill() {
        let (r, missing) = log_returns_bps(&[100.0, 101.0, 0.0, 102.0], 3).unwrap();
        assert_eq!(r, vec![100, 0, 0]);
        assert_eq!(missing, 2);
        assert!(log_returns_bps(&[1.0, 2.0], 2).is_none());
    }

    #[test]
    fn test_pearson_extremes() {
        let a: Vec<f64> = (0..10).map(f64::from).collect();
        let b: Vec<f64> = a.iter().map(|x| 3.0 * x + 1.0).collect();
        let c: Vec<f64> = a.iter().map(|x| -x).collect();
        assert!((pearson(&a, &b).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&a, &c).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson(&a, &[1.0; 10]).is_none());
    }

    proptest! {
        #[test]
        fn prop_pearson_bounded(a in prop::collection::vec(-1e3f64..1e3, 3..50),
                                b in prop::collection::vec(-1e3f64..1e3, 3..50)) {
            if let Some(r) = pearson(&a, &b) {
                prop_assert!((-1.0..=1.0).contains(&r));
            }
        }
    }
}
