//! Strike arithmetic

use rust_decimal::{Decimal, RoundingStrategy};

/// At-the-money strike: `price` rounded to the nearest multiple of `increment`
///
/// Ties round up (away from zero; prices are positive). Returns `None` for a
/// non-positive increment.
pub fn atm_strike(price: Decimal, increment: Decimal) -> Option<Decimal> {
    if increment <= Decimal::ZERO {
        return None;
    }
    let steps = (price / increment).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    Some((steps * increment).normalize())
}

/// Strikes `atm - half_width * increment ..= atm + half_width * increment`
///
/// Ascending; non-positive strikes are left out.
pub fn strike_window(atm: Decimal, increment: Decimal, half_width: u32) -> Vec<Decimal> {
    let half_width = i64::from(half_width);
    (-half_width..=half_width)
        .map(|offset| (atm + Decimal::from(offset) * increment).normalize())
        .filter(|strike| *strike > Decimal::ZERO)
        .collect()
}
