//! Filter quantization
//!
//! Prices and quantities are truncated toward zero onto the tick and step
//! grids, then checked against every bound the exchange publishes. Nothing
//! is ever rounded up: a quantized order never costs more than requested.

use crate::error::{OmsError, OmsResult};
use common::ReasonCode;
use common::decimal::{decimal_places, format_plain, format_with_places, parse_decimal, parse_step, quantize_down_dec};
use common::model::DecisionConstraints;
use rust_decimal::Decimal;

/// Order values before quantization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizeRequest {
    /// Limit price, or the reference price of a market order
    pub price: String,
    /// Base quantity
    pub qty: String,
    /// Trailing delta in bips; `0` when not trailing
    pub trailing_delta_bips: i64,
}

/// Order values on the exchange grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantized {
    /// Price with the tick's fractional digits
    pub price: String,
    /// Quantity with the step's fractional digits
    pub qty: String,
    /// `price * qty`
    pub notional: String,
}

fn filter(detail: impl Into<String>) -> OmsError {
    OmsError::Quantize {
        reason: ReasonCode::ProtectionInvalidFilter,
        detail: detail.into(),
    }
}

fn value(field: &str, raw: &str) -> OmsResult<Decimal> {
    parse_decimal(raw).map_err(|e| filter(format!("{field}: {e}")))
}

/// Upper bound where `"0"` means unbounded
fn ceiling(field: &str, raw: &str) -> OmsResult<Option<Decimal>> {
    let v = value(field, raw)?;
    Ok((!v.is_zero()).then_some(v))
}

/// Quantize `req` onto `constraints`
///
/// # Errors
///
/// Returns `PROTECTION_INVALID_MIN_NOTIONAL` when the quantized notional is
/// below the minimum and `PROTECTION_INVALID_FILTER` for every other bound.
pub fn quantize_order(req: &QuantizeRequest, constraints: &DecisionConstraints) -> OmsResult<Quantized> {
    let tick = parse_step(&constraints.tick_size).map_err(|e| filter(format!("tick_size: {e}")))?;
    let step = parse_step(&constraints.step_size).map_err(|e| filter(format!("step_size: {e}")))?;

    let price = quantize_down_dec(value("price", &req.price)?, tick).map_err(|e| filter(format!("price: {e}")))?;
    let min_price = value("min_price", &constraints.min_price)?;
    if price.is_zero() || price < min_price {
        return Err(filter(format!("price {} below min_price {min_price}", format_plain(price))));
    }
    if let Some(max_price) = ceiling("max_price", &constraints.max_price)? {
        if price > max_price {
            return Err(filter(format!("price {} above max_price {max_price}", format_plain(price))));
        }
    }

    let qty = quantize_down_dec(value("qty", &req.qty)?, step).map_err(|e| filter(format!("qty: {e}")))?;
    let min_qty = value("min_qty", &constraints.min_qty)?;
    if qty.is_zero() || qty < min_qty {
        return Err(filter(format!("qty {} below min_qty {min_qty}", format_plain(qty))));
    }
    if let Some(max_qty) = ceiling("max_qty", &constraints.max_qty)? {
        if qty > max_qty {
            return Err(filter(format!("qty {} above max_qty {max_qty}", format_plain(qty))));
        }
    }

    let notional = price.checked_mul(qty).ok_or_else(|| filter("notional overflow"))?;
    let min_notional = value("min_notional", &constraints.min_notional)?;
    if notional < min_notional {
        return Err(OmsError::Quantize {
            reason: ReasonCode::ProtectionInvalidMinNotional,
            detail: format!("notional {} below {min_notional}", format_plain(notional)),
        });
    }
    if let Some(raw) = &constraints.max_notional {
        if let Some(max_notional) = ceiling("max_notional", raw)? {
            if notional > max_notional {
                return Err(filter(format!("notional {} above {max_notional}", format_plain(notional))));
            }
        }
    }

    if req.trailing_delta_bips > 0 {
        let Some(td) = constraints.trailing_delta else {
            return Err(filter("trailing delta not supported for symbol"));
        };
        let delta = req.trailing_delta_bips;
        if delta < td.min_bips || delta > td.max_bips {
            return Err(filter(format!("trailing delta {delta} outside [{}, {}]", td.min_bips, td.max_bips)));
        }
        if td.step_bips > 0 && (delta - td.min_bips) % td.step_bips != 0 {
            return Err(filter(format!("trailing delta {delta} off step {}", td.step_bips)));
        }
    }

    Ok(Quantized {
        price: format_with_places(price, decimal_places(&constraints.tick_size)),
        qty: format_with_places(qty, decimal_places(&constraints.step_size)),
        notional: format_plain(notional),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::decimal::is_multiple_of;
    use common::model::market::fixtures::btc_filters;
    use proptest::prelude::*;
    use rstest::rstest;

    fn constraints() -> DecisionConstraints {
        btc_filters().to_constraints().unwrap()
    }

    fn req(price: &str, qty: &str) -> QuantizeRequest {
        QuantizeRequest {
            price: price.into(),
            qty: qty.into(),
            trailing_delta_bips: 0,
        }
    }

    #[test]
    fn test_truncates_onto_grid() {
        let q = quantize_order(&req("100.009", "0.1234"), &constraints()).unwrap();
        assert_eq!(q.price, "100.00");
        assert_eq!(q.qty, "0.123");
        assert_eq!(q.notional, "12.3");
    }

    #[test]
    fn test_small_order_fails_min_notional() {
        let err = quantize_order(&req("100.009", "0.05"), &constraints()).unwrap_err();
        assert!(matches!(
            err,
            OmsError::Quantize {
                reason: ReasonCode::ProtectionInvalidMinNotional,
                ..
            }
        ));
    }

    #[rstest]
    #[case::price_below_tick("0.001", "1.000")]
    #[case::qty_below_step("100.00", "0.0009")]
    #[case::qty_above_max("100.00", "9000.001")]
    #[case::price_above_max("1000000.01", "1.000")]
    #[case::not_decimal("1e2", "1.000")]
    fn test_filter_violations(#[case] price: &str, #[case] qty: &str) {
        let err = quantize_order(&req(price, qty), &constraints()).unwrap_err();
        assert!(
            matches!(
                err,
                OmsError::Quantize {
                    reason: ReasonCode::ProtectionInvalidFilter,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[rstest]
    #[case(10, true)]
    #[case(160, true)]
    #[case(2_000, true)]
    #[case(9, false)]
    #[case(2_001, false)]
    fn test_trailing_delta_bounds(#[case] delta: i64, #[case] ok: bool) {
        let r = QuantizeRequest {
            trailing_delta_bips: delta,
            ..req("100.00", "1.000")
        };
        assert_eq!(quantize_order(&r, &constraints()).is_ok(), ok);
    }

    #[test]
    fn test_trailing_delta_without_filter_rejected() {
        let mut c = constraints();
        c.trailing_delta = None;
        let r = QuantizeRequest {
            trailing_delta_bips: 100,
            ..req("100.00", "1.000")
        };
        assert!(quantize_order(&r, &c).is_err());
    }

    proptest! {
        #[test]
        fn quantized_orders_sit_on_grid(price_milli in 1_000u64..10_000_000, qty_micro in 1u64..50_000_000) {
            let price = format!("{}.{:03}", price_milli / 1_000, price_milli % 1_000);
            let qty = format!("{}.{:06}", qty_micro / 1_000_000, qty_micro % 1_000_000);
            let c = constraints();
            if let Ok(q) = quantize_order(&req(&price, &qty), &c) {
                let p = parse_decimal(&q.price).unwrap();
                let n = parse_decimal(&q.qty).unwrap();
                prop_assert!(is_multiple_of(p, parse_decimal(&c.tick_size).unwrap()));
                prop_assert!(is_multiple_of(n, parse_decimal(&c.step_size).unwrap()));
                prop_assert!(p * n >= parse_decimal(&c.min_notional).unwrap());
                prop_assert!(n >= parse_decimal(&c.min_qty).unwrap());
                prop_assert!(n <= parse_decimal(&c.max_qty).unwrap());
                prop_assert!(p <= parse_decimal(&price).unwrap());
            }
        }
    }
}
