//! Fixed-point money helpers. Balances are `Decimal` rounded to cents; rates
//! stay `f64` and are converted at the point they touch a balance.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

pub type Money = Decimal;

const CENT_PLACES: u32 = 2;

/// Largest balance a projection path may carry (10^20). Sums over a path or
/// over every Monte Carlo run stay inside `Decimal`'s range below it.
pub const MAX_BALANCE: Money = Decimal::from_parts(1_661_992_960, 1_808_227_885, 5, false, 0);

pub fn round_cents(value: Money) -> Money {
    value.round_dp_with_strategy(CENT_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts a validated, finite rate into a decimal factor. Non-finite values
/// never reach this point because every request is validated first.
pub fn rate(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// `amount * rate`, rounded to cents.
pub fn apply_rate(amount: Money, value: f64) -> Money {
    round_cents(amount * rate(value))
}

/// `amount * rate`, rounded to cents, or `None` when the product does not fit.
pub fn checked_apply_rate(amount: Money, value: f64) -> Option<Money> {
    amount.checked_mul(rate(value)).map(round_cents)
}

pub fn to_f64(value: Money) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Lossy float to money conversion, rounded to cents. `None` for NaN/inf.
pub fn from_f64(value: f64) -> Option<Money> {
    Decimal::from_f64(value).map(round_cents)
}

/// `(a - b) / b * 100`, or `None` when `b` is zero.
pub fn percentage_difference(a: Money, b: Money) -> Option<f64> {
    if b.is_zero() {
        return None;
    }
    ((a - b) / b * Decimal::ONE_HUNDRED).to_f64()
}
