//! Decimal amount <-> integer minor units (tiyin for som).

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use std::str::FromStr;

pub const MINOR_PER_MAJOR: i64 = 100;
const FRACTION_DIGITS: usize = 2;

/// Parse a gateway amount string such as `"1500"`, `"1500.5"` or
/// `"1500.00"` into minor units.
///
/// Returns `None` for anything that is not a plain non-negative decimal with
/// at most two fractional digits: signs, exponents, separators, blanks and
/// sub-tiyin precision are all invalid. Callers map `None` to their
/// gateway's amount error.
pub fn parse_amount_to_minor_units(amount: &str) -> Option<i64> {
    let s = amount.trim();
    let (whole, fraction) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.contains('.') && fraction.is_empty() {
        return None;
    }

    let significant = fraction.trim_end_matches('0');
    if significant.len() > FRACTION_DIGITS {
        return None;
    }

    let decimal = BigDecimal::from_str(s).ok()?;
    decimal_to_minor_units(&decimal)
}

/// Major-unit decimal to minor units, rounding half away from zero at the
/// tiyin. `None` when negative or out of range.
pub fn decimal_to_minor_units(amount: &BigDecimal) -> Option<i64> {
    let scaled = (amount * BigDecimal::from(MINOR_PER_MAJOR)).with_scale_round(0, RoundingMode::HalfUp);
    let minor = scaled.to_i64()?;
    (minor >= 0).then_some(minor)
}

/// `150050` -> `"1500.50"`. Display and outbound links only, never
/// signature input.
pub fn format_minor_units(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    let per = MINOR_PER_MAJOR as u64;
    format!("{}{}.{:02}", sign, abs / per, abs % per)
}
