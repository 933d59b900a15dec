//! One-period growth recurrence shared by every projection path.
//!
//! Order within a period is fixed: growth on the opening balance, then the
//! contribution, then fees on the post-growth post-contribution balance.

use rust_decimal::Decimal;

use super::money::{Money, checked_apply_rate};
use crate::error::{EngineError, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeriodLength {
    Annual,
    Monthly,
}

impl PeriodLength {
    pub fn periods_per_year(self) -> u32 {
        match self {
            PeriodLength::Annual => 1,
            PeriodLength::Monthly => 12,
        }
    }

    /// Geometric split of an annual rate, so compounding every period of a
    /// year reproduces the annual rate exactly.
    pub fn return_rate(self, annual_rate: f64) -> f64 {
        match self {
            PeriodLength::Annual => annual_rate,
            PeriodLength::Monthly => {
                (1.0 + annual_rate).max(0.0).powf(1.0 / self.periods_per_year() as f64) - 1.0
            }
        }
    }

    pub fn fee_rate(self, annual_fee: f64) -> f64 {
        match self {
            PeriodLength::Annual => annual_fee,
            PeriodLength::Monthly => {
                1.0 - (1.0 - annual_fee).max(0.0).powf(1.0 / self.periods_per_year() as f64)
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PeriodRates {
    pub growth: f64,
    pub fee: f64,
}

impl PeriodRates {
    pub fn new(length: PeriodLength, annual_return_rate: f64, annual_fee: f64) -> Self {
        Self {
            growth: length.return_rate(annual_return_rate),
            fee: length.fee_rate(annual_fee),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PeriodStep {
    pub opening: Money,
    pub growth: Money,
    pub contribution: Money,
    pub fees: Money,
    pub closing: Money,
}

/// Fails with [`EngineError::Overflow`] when any intermediate amount leaves
/// `Decimal`'s range.
pub fn compound_period(
    opening: Money,
    contribution: Money,
    rates: PeriodRates,
) -> Result<PeriodStep> {
    let overflow = || EngineError::Overflow {
        context: "compounding a period",
    };
    let growth = checked_apply_rate(opening, rates.growth).ok_or_else(overflow)?;
    let invested = opening
        .checked_add(growth)
        .and_then(|value| value.checked_add(contribution))
        .ok_or_else(overflow)?;
    let fees = checked_apply_rate(invested.max(Decimal::ZERO), rates.fee).ok_or_else(overflow)?;
    let closing = invested.checked_sub(fees).ok_or_else(overflow)?;

    Ok(PeriodStep {
        opening,
        growth,
        contribution,
        fees,
        closing,
    })
}
