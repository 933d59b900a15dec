use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::debug;

use super::allocation::{AllocationTables, RiskLevel, allocate};
use super::money::{Money, percentage_difference, round_cents};
use super::projector::project;
use super::types::{ContributionFrequency, MONTHS_PER_YEAR, ScenarioInput};
use crate::error::{Result, ValidationErrors};

/// Share of the total invested immediately by the partial strategy.
pub const PARTIAL_LUMP_SHARE: Decimal = dec!(0.5);
/// Portfolio volatility at or above which averaging in is recommended.
pub const HIGH_VOLATILITY: f64 = 0.12;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    LumpSum,
    DollarCostAveraging,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutcome {
    pub strategy: StrategyKind,
    pub rank: u32,
    /// Cash invested at month zero, including the first tranche.
    pub upfront_amount: Money,
    pub tranche_amount: Money,
    pub tranches: u32,
    pub total_invested: Money,
    pub final_balance: Money,
    pub total_growth: Money,
    pub cagr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDelta {
    pub from: StrategyKind,
    pub to: StrategyKind,
    /// `(to - from) / from * 100`; `None` when `from` ended at zero.
    pub percentage_difference: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResult {
    pub total_amount: Money,
    pub time_horizon_years: u32,
    pub risk_level: RiskLevel,
    pub dca_periods: u32,
    pub expected_return: f64,
    pub volatility: f64,
    /// Ordered best first.
    pub strategies: Vec<StrategyOutcome>,
    pub best_strategy: StrategyKind,
    pub deltas: Vec<StrategyDelta>,
    pub recommendation: String,
}

struct Plan {
    strategy: StrategyKind,
    upfront: Money,
    tranche: Money,
    tranches: u32,
}

impl Plan {
    fn lump_sum(total: Money) -> Self {
        Self {
            strategy: StrategyKind::LumpSum,
            upfront: total,
            tranche: Decimal::ZERO,
            tranches: 1,
        }
    }

    /// `held` goes in at once; `averaged` is split into `tranches` monthly
    /// installments, the first at month zero. Rounding remainders land in the
    /// month-zero amount so the plan deploys exactly `held + averaged`.
    fn averaged(strategy: StrategyKind, held: Money, averaged: Money, tranches: u32) -> Self {
        let tranche = round_cents(averaged / Decimal::from(tranches));
        let later = tranche * Decimal::from(tranches - 1);
        Self {
            strategy,
            upfront: held + averaged - later,
            tranche,
            tranches,
        }
    }

    fn scenario(&self, annual_return_rate: f64, years: u32) -> ScenarioInput {
        ScenarioInput {
            contribution_amount: if self.tranches > 1 { self.tranche } else { Decimal::ZERO },
            contribution_frequency: ContributionFrequency::Monthly,
            contribution_months: Some(self.tranches - 1),
            ..ScenarioInput::lump_sum(self.upfront, annual_return_rate, years)
        }
    }
}

pub fn compare_strategies(
    total_amount: Money,
    time_horizon_years: u32,
    risk_level: RiskLevel,
    dca_periods: u32,
    tables: &AllocationTables,
) -> Result<StrategyResult> {
    let mut errors = ValidationErrors::new();
    if total_amount <= Decimal::ZERO {
        errors.push("total_amount", "must be > 0");
    }
    if time_horizon_years == 0 {
        errors.push("time_horizon_years", "must be >= 1");
    }
    let max_periods = time_horizon_years.saturating_mul(MONTHS_PER_YEAR).max(1);
    if dca_periods == 0 || dca_periods > max_periods {
        errors.push(
            "dca_periods",
            format!("must be between 1 and {max_periods} months"),
        );
    }
    errors.into_result(())?;

    let portfolio = allocate(risk_level, None, Some(time_horizon_years), tables)?;
    let expected_return = portfolio.expected_return;
    let volatility = portfolio.volatility;
    debug!(
        %total_amount,
        time_horizon_years,
        dca_periods,
        expected_return,
        "comparing strategies"
    );

    let held = round_cents(total_amount * PARTIAL_LUMP_SHARE);
    let plans = [
        Plan::lump_sum(total_amount),
        Plan::averaged(
            StrategyKind::DollarCostAveraging,
            Decimal::ZERO,
            total_amount,
            dca_periods,
        ),
        Plan::averaged(StrategyKind::Partial, held, total_amount - held, dca_periods),
    ];

    let mut strategies = Vec::with_capacity(plans.len());
    for plan in &plans {
        let summary = project(&plan.scenario(expected_return, time_horizon_years), false)?.summary;
        strategies.push(StrategyOutcome {
            strategy: plan.strategy,
            rank: 0,
            upfront_amount: plan.upfront,
            tranche_amount: plan.tranche,
            tranches: plan.tranches,
            total_invested: summary.total_contributions,
            final_balance: summary.final_balance,
            total_growth: summary.total_growth,
            cagr: summary.cagr,
        });
    }

    let final_of = |kind: StrategyKind| -> Money {
        strategies
            .iter()
            .find(|s| s.strategy == kind)
            .map(|s| s.final_balance)
            .unwrap_or(Decimal::ZERO)
    };
    let deltas = [
        (StrategyKind::LumpSum, StrategyKind::DollarCostAveraging),
        (StrategyKind::LumpSum, StrategyKind::Partial),
        (StrategyKind::DollarCostAveraging, StrategyKind::Partial),
    ]
    .into_iter()
    .map(|(from, to)| StrategyDelta {
        from,
        to,
        percentage_difference: percentage_difference(final_of(to), final_of(from)),
    })
    .collect();

    // Stable sort: ties keep lump sum, DCA, partial order.
    strategies.sort_by(|a, b| b.final_balance.cmp(&a.final_balance));
    for (index, outcome) in strategies.iter_mut().enumerate() {
        outcome.rank = index as u32 + 1;
    }
    let best_strategy = strategies
        .first()
        .map(|s| s.strategy)
        .unwrap_or(StrategyKind::LumpSum);

    Ok(StrategyResult {
        total_amount,
        time_horizon_years,
        risk_level,
        dca_periods,
        expected_return,
        volatility,
        recommendation: recommend(best_strategy, volatility, time_horizon_years),
        strategies,
        best_strategy,
        deltas,
    })
}

fn recommend(best: StrategyKind, volatility: f64, years: u32) -> String {
    let lead = match best {
        StrategyKind::LumpSum => "Lump sum investing finishes highest at the expected return",
        StrategyKind::DollarCostAveraging => "Dollar-cost averaging finishes highest",
        StrategyKind::Partial => "Partial investing finishes highest",
    };
    let volatility_pct = volatility * 100.0;
    if volatility >= HIGH_VOLATILITY {
        format!(
            "{lead}, but at {volatility_pct:.1}% volatility dollar-cost averaging or a partial lump sum limits the damage of investing everything just before a downturn."
        )
    } else if years < 3 {
        format!("{lead}; over a horizon this short the gap between strategies is small.")
    } else {
        format!("{lead}; at {volatility_pct:.1}% volatility investing immediately is usually preferable.")
    }
}
