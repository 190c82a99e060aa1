//! Decimal string discipline
//!
//! Prices and quantities cross every boundary as plain decimal strings
//! (`^[0-9]+(\.[0-9]+)?$`). Arithmetic happens on [`Decimal`]; floats never
//! touch accounting values.

use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;
use thiserror::Error;

/// Decimal discipline failures; all surface as `STRAT_INPUT_INVALID`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecimalError {
    /// String does not match the decimal grammar
    #[error("Invalid decimal string: {0:?}")]
    Invalid(String),

    /// Step or tick must be strictly positive
    #[error("Step must be positive: {0}")]
    NonPositiveStep(String),

    /// Negative value where only non-negative is allowed
    #[error("Negative value: {0}")]
    Negative(String),

    /// Result outside the representable range
    #[error("Decimal overflow")]
    Overflow,
}

/// True iff `s` matches `^[0-9]+(\.[0-9]+)?$`
#[must_use]
pub fn is_decimal_string(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    digits(int) && frac.is_none_or(digits)
}

/// Parse a conforming decimal string
pub fn parse_decimal(s: &str) -> Result<Decimal, DecimalError> {
    if !is_decimal_string(s) {
        return Err(DecimalError::Invalid(s.to_string()));
    }
    Decimal::from_str(s).map_err(|_| DecimalError::Invalid(s.to_string()))
}

/// Parse a strictly positive step or tick
pub fn parse_step(s: &str) -> Result<Decimal, DecimalError> {
    let step = parse_decimal(s)?;
    if step <= Decimal::ZERO {
        return Err(DecimalError::NonPositiveStep(s.to_string()));
    }
    Ok(step)
}

/// Number of fractional digits as written, trailing zeros included
///
/// `"0.10"` has two, `"1"` has none.
#[must_use]
pub fn decimal_places(s: &str) -> u32 {
    s.split_once('.')
        .map_or(0, |(_, frac)| u32::try_from(frac.len()).unwrap_or(u32::MAX))
}

/// `floor(v / s) * s`, formatted with exactly `decimal_places(step)` digits
pub fn quantize_down(value: &str, step: &str) -> Result<String, DecimalError> {
    let v = parse_decimal(value)?;
    let s = parse_step(step)?;
    let q = quantize_down_dec(v, s)?;
    Ok(format_with_places(q, decimal_places(step)))
}

/// Decimal form of [`quantize_down`]
pub fn quantize_down_dec(value: Decimal, step: Decimal) -> Result<Decimal, DecimalError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(DecimalError::Negative(value.to_string()));
    }
    if step <= Decimal::ZERO {
        return Err(DecimalError::NonPositiveStep(step.to_string()));
    }
    let rem = value.checked_rem(step).ok_or(DecimalError::Overflow)?;
    value.checked_sub(rem).ok_or(DecimalError::Overflow)
}

/// Render `value` with exactly `places` fractional digits, truncating extras
#[must_use]
pub fn format_with_places(value: Decimal, places: u32) -> String {
    let mut v = value.round_dp_with_strategy(places, RoundingStrategy::ToZero);
    v.rescale(places);
    v.to_string()
}

/// Render without trailing zeros; integers carry no fractional part
#[must_use]
pub fn format_plain(value: Decimal) -> String {
    value.normalize().to_string()
}

/// True iff `value` is an exact multiple of `step`
#[must_use]
pub fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    if step <= Decimal::ZERO {
        return false;
    }
    value.checked_rem(step).is_some_and(|r| r.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", true)]
    #[case("104.00", true)]
    #[case("0.10", true)]
    #[case("", false)]
    #[case(".5", false)]
    #[case("5.", false)]
    #[case("-1", false)]
    #[case("1e5", false)]
    #[case("1.2.3", false)]
    #[case(" 1", false)]
    fn test_decimal_grammar(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(is_decimal_string(input), ok);
        assert_eq!(parse_decimal(input).is_ok(), ok);
    }

    #[rstest]
    #[case("0.10", 2)]
    #[case("0.001", 3)]
    #[case("1", 0)]
    #[case("1.00000000", 8)]
    fn test_decimal_places_preserves_trailing_zeros(#[case] step: &str, #[case] places: u32) {
        assert_eq!(decimal_places(step), places);
    }

    #[rstest]
    #[case("100.009", "0.01", "100.00")]
    #[case("0.1234", "0.001", "0.123")]
    #[case("5", "0.10", "5.00")]
    #[case("17", "5", "15")]
    #[case("0.00000999", "0.00001", "0.00000")]
    fn test_quantize_down(#[case] v: &str, #[case] s: &str, #[case] want: &str) {
        assert_eq!(quantize_down(v, s).unwrap(), want);
    }

    #[test]
    fn test_quantize_rejects_bad_inputs() {
        assert!(matches!(quantize_down("1", "0"), Err(DecimalError::NonPositiveStep(_))));
        assert!(matches!(quantize_down("abc", "0.1"), Err(DecimalError::Invalid(_))));
    }

    proptest! {
        #[test]
        fn prop_quantized_is_multiple_and_not_above(units in 0u64..10_000_000, step_exp in 0u32..6) {
            let value = Decimal::new(i64::try_from(units).unwrap(), 4);
            let step = Decimal::new(1, step_exp);
            let q = quantize_down_dec(value, step).unwrap();
            prop_assert!(q <= value);
            prop_assert!(is_multiple_of(q, step));
            prop_assert!(value - q < step);
        }
    }
}
