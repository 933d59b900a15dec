use rust_decimal::Decimal;
use tracing::debug;

use super::compounding::{PeriodLength, PeriodRates, compound_period};
use super::money::{MAX_BALANCE, Money, apply_rate, checked_apply_rate, rate, round_cents, to_f64};
use super::types::{MONTHS_PER_YEAR, PeriodProjection, ProjectionResult, ProjectionSummary, ScenarioInput};
use crate::error::{EngineError, Result};

pub fn project(scenario: &ScenarioInput, include_monthly: bool) -> Result<ProjectionResult> {
    scenario.validate()?;

    let annual_returns = vec![scenario.annual_return_rate; scenario.time_horizon_years as usize];
    let mut monthly = include_monthly.then(|| {
        Vec::with_capacity((scenario.time_horizon_years * MONTHS_PER_YEAR) as usize + 1)
    });
    let annual = run_path(scenario, &annual_returns, monthly.as_mut())?;
    let summary = summarize(scenario, &annual);

    debug!(
        years = scenario.time_horizon_years,
        include_monthly,
        final_balance = %summary.final_balance,
        "projected scenario"
    );

    Ok(ProjectionResult {
        summary,
        annual_projection: annual,
        monthly_projection: monthly,
    })
}

/// Runs the monthly recurrence with one annual return per year and returns
/// the annual rows (year 0 is the opening snapshot). Monthly rows are pushed
/// into `monthly` when provided. A balance or yearly contribution above
/// [`MAX_BALANCE`] fails the path with [`EngineError::Overflow`].
pub(crate) fn run_path(
    scenario: &ScenarioInput,
    annual_returns: &[f64],
    mut monthly: Option<&mut Vec<PeriodProjection>>,
) -> Result<Vec<PeriodProjection>> {
    let mut annual = Vec::with_capacity(annual_returns.len() + 1);
    let opening = snapshot(scenario.initial_amount);
    annual.push(opening.clone());
    if let Some(rows) = monthly.as_deref_mut() {
        rows.push(opening);
    }

    let mut balance = scenario.initial_amount;
    let mut month_index = 0_u32;

    for (year, &annual_return) in annual_returns.iter().enumerate() {
        let rates = PeriodRates::new(PeriodLength::Monthly, annual_return, scenario.fee_percentage);
        let contribution_multiplier = (1.0 + scenario.contribution_growth_rate).powi(year as i32);
        let year_amount = checked_apply_rate(scenario.contribution_amount, contribution_multiplier)
            .filter(|amount| *amount <= MAX_BALANCE)
            .ok_or(EngineError::Overflow {
                context: "growing the contribution",
            })?;

        let mut year_row = PeriodProjection {
            period_index: year as u32 + 1,
            opening_balance: balance,
            contribution_in_period: Decimal::ZERO,
            growth_in_period: Decimal::ZERO,
            fees_in_period: Decimal::ZERO,
            taxes_in_period: Decimal::ZERO,
            closing_balance: balance,
            inflation_adjusted_closing_balance: balance,
        };

        for _ in 0..MONTHS_PER_YEAR {
            let contribution = scenario.contribution_for_month(month_index, year_amount);
            let step = compound_period(balance, contribution, rates)?;
            let taxes = growth_tax(scenario, step.growth);
            let closing = step.closing - taxes;
            if closing > MAX_BALANCE {
                return Err(EngineError::Overflow {
                    context: "projecting the balance",
                });
            }
            month_index += 1;

            if let Some(rows) = monthly.as_deref_mut() {
                rows.push(PeriodProjection {
                    period_index: month_index,
                    opening_balance: step.opening,
                    contribution_in_period: step.contribution,
                    growth_in_period: step.growth,
                    fees_in_period: step.fees,
                    taxes_in_period: taxes,
                    closing_balance: closing,
                    inflation_adjusted_closing_balance: deflate(
                        closing,
                        scenario.inflation_rate,
                        month_index as f64 / MONTHS_PER_YEAR as f64,
                    ),
                });
            }

            year_row.contribution_in_period += step.contribution;
            year_row.growth_in_period += step.growth;
            year_row.fees_in_period += step.fees;
            year_row.taxes_in_period += taxes;
            balance = closing;
        }

        year_row.closing_balance = balance;
        year_row.inflation_adjusted_closing_balance =
            deflate(balance, scenario.inflation_rate, (year + 1) as f64);
        annual.push(year_row);
    }

    Ok(annual)
}

pub(crate) fn summarize(scenario: &ScenarioInput, annual: &[PeriodProjection]) -> ProjectionSummary {
    let final_balance = annual
        .last()
        .map(|row| row.closing_balance)
        .unwrap_or(scenario.initial_amount);
    let total_contributions = scenario.initial_amount
        + annual
            .iter()
            .map(|row| row.contribution_in_period)
            .sum::<Money>();
    let total_growth = annual.iter().map(|row| row.growth_in_period).sum::<Money>();
    let total_fees = annual.iter().map(|row| row.fees_in_period).sum::<Money>();
    let total_taxes = annual.iter().map(|row| row.taxes_in_period).sum::<Money>();
    let inflation_adjusted_final_balance = deflate(
        final_balance,
        scenario.inflation_rate,
        scenario.time_horizon_years as f64,
    );

    ProjectionSummary {
        final_balance,
        total_contributions,
        total_growth,
        total_fees,
        total_taxes,
        cagr: cagr(scenario.initial_amount, final_balance, scenario.time_horizon_years),
        inflation_adjusted_final_balance,
        real_gain: inflation_adjusted_final_balance - total_contributions,
    }
}

/// Undefined (None) without a positive starting amount or a positive horizon.
pub fn cagr(initial_amount: Money, final_balance: Money, years: u32) -> Option<f64> {
    if initial_amount <= Decimal::ZERO || years == 0 {
        return None;
    }
    let ratio = to_f64(final_balance / initial_amount);
    if ratio < 0.0 {
        return None;
    }
    let value = ratio.powf(1.0 / years as f64) - 1.0;
    value.is_finite().then_some(value)
}

fn growth_tax(scenario: &ScenarioInput, growth: Money) -> Money {
    if scenario.tax_deferred || growth <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    apply_rate(growth, scenario.tax_rate)
}

fn deflate(balance: Money, inflation_rate: f64, years: f64) -> Money {
    let deflator = (1.0 + inflation_rate).powf(years);
    if deflator <= 0.0 || !deflator.is_finite() {
        return balance;
    }
    round_cents(balance / rate(deflator))
}

fn snapshot(balance: Money) -> PeriodProjection {
    PeriodProjection {
        period_index: 0,
        opening_balance: balance,
        contribution_in_period: Decimal::ZERO,
        growth_in_period: Decimal::ZERO,
        fees_in_period: Decimal::ZERO,
        taxes_in_period: Decimal::ZERO,
        closing_balance: balance,
        inflation_adjusted_closing_balance: balance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ContributionFrequency;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};
    use rust_decimal_macros::dec;

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn example_scenario() -> ScenarioInput {
        ScenarioInput {
            contribution_amount: dec!(500),
            contribution_frequency: ContributionFrequency::Monthly,
            ..ScenarioInput::lump_sum(dec!(10000), 0.07, 10)
        }
    }

    fn assert_rows_balance(rows: &[PeriodProjection]) {
        for row in rows {
            assert_eq!(
                row.closing_balance,
                row.opening_balance + row.contribution_in_period + row.growth_in_period
                    - row.fees_in_period
                    - row.taxes_in_period,
                "row {} does not balance",
                row.period_index
            );
        }
    }

    #[test]
    fn lump_sum_matches_closed_form_compounding() {
        let scenario = ScenarioInput::lump_sum(dec!(10000), 0.07, 10);
        let result = project(&scenario, false).expect("valid scenario");
        let expected = 10_000.0 * 1.07_f64.powi(10);
        assert_approx_tol(to_f64(result.summary.final_balance), expected, 1.0);
        assert_eq!(result.annual_projection.len(), 11);
    }

    #[test]
    fn example_scenario_matches_lump_sum_plus_annuity_formula() {
        let result = project(&example_scenario(), false).expect("valid scenario");
        let monthly = 1.07_f64.powf(1.0 / 12.0) - 1.0;
        let lump = 10_000.0 * 1.07_f64.powi(10);
        let annuity = 500.0 * ((1.0 + monthly).powi(120) - 1.0) / monthly;
        let final_balance = to_f64(result.summary.final_balance);
        assert_approx_tol(final_balance, lump + annuity, 2.0);
        assert!((105_000.0..105_400.0).contains(&final_balance));
        assert_eq!(result.summary.total_contributions, dec!(70000));
    }

    #[test]
    fn zero_horizon_returns_single_snapshot() {
        let scenario = ScenarioInput {
            time_horizon_years: 0,
            ..example_scenario()
        };
        let result = project(&scenario, true).expect("valid scenario");
        assert_eq!(result.annual_projection.len(), 1);
        assert_eq!(result.summary.final_balance, dec!(10000));
        assert_eq!(result.summary.total_growth, Decimal::ZERO);
        assert_eq!(result.summary.cagr, None);
        assert_eq!(result.monthly_projection.map(|rows| rows.len()), Some(1));
    }

    #[test]
    fn zero_initial_amount_reports_no_cagr() {
        let scenario = ScenarioInput {
            initial_amount: Decimal::ZERO,
            ..example_scenario()
        };
        let result = project(&scenario, false).expect("valid scenario");
        assert_eq!(result.summary.cagr, None);
        assert!(result.summary.final_balance > Decimal::ZERO);
    }

    #[test]
    fn cagr_matches_rate_for_lump_sum() {
        let scenario = ScenarioInput::lump_sum(dec!(5000), 0.05, 8);
        let result = project(&scenario, false).expect("valid scenario");
        assert_approx_tol(result.summary.cagr.expect("cagr defined"), 0.05, 1e-5);
    }

    #[test]
    fn negative_returns_shrink_without_floor() {
        let scenario = ScenarioInput::lump_sum(dec!(10000), -0.2, 3);
        let result = project(&scenario, false).expect("valid scenario");
        assert_approx_tol(to_f64(result.summary.final_balance), 5_120.0, 0.5);
        assert!(result.summary.total_growth < Decimal::ZERO);
    }

    #[test]
    fn monthly_rows_roll_up_into_annual_rows() {
        let scenario = ScenarioInput {
            fee_percentage: 0.01,
            tax_rate: 0.15,
            contribution_growth_rate: 0.03,
            inflation_rate: 0.02,
            ..example_scenario()
        };
        let result = project(&scenario, true).expect("valid scenario");
        let monthly = result.monthly_projection.expect("monthly requested");
        assert_eq!(monthly.len(), 121);
        assert_rows_balance(&monthly);
        assert_rows_balance(&result.annual_projection);

        for year in 1..=10usize {
            let months = &monthly[(year - 1) * 12 + 1..=year * 12];
            let annual = &result.annual_projection[year];
            assert_eq!(annual.closing_balance, months[11].closing_balance);
            assert_eq!(
                annual.growth_in_period,
                months.iter().map(|m| m.growth_in_period).sum::<Money>()
            );
            assert_eq!(
                annual.inflation_adjusted_closing_balance,
                months[11].inflation_adjusted_closing_balance
            );
        }
    }

    #[test]
    fn contribution_escalates_once_per_year() {
        let scenario = ScenarioInput {
            contribution_growth_rate: 0.10,
            ..example_scenario()
        };
        let result = project(&scenario, true).expect("valid scenario");
        assert_eq!(result.annual_projection[1].contribution_in_period, dec!(6000));
        assert_eq!(result.annual_projection[2].contribution_in_period, dec!(6600));
        let monthly = result.monthly_projection.expect("monthly requested");
        assert_eq!(monthly[12].contribution_in_period, dec!(500));
        assert_eq!(monthly[13].contribution_in_period, dec!(550));
    }

    #[test]
    fn tax_applies_to_growth_only_unless_deferred() {
        let taxed = ScenarioInput {
            tax_rate: 0.25,
            ..ScenarioInput::lump_sum(dec!(10000), 0.08, 5)
        };
        let taxed_result = project(&taxed, false).expect("valid scenario");
        let deferred_result = project(
            &ScenarioInput {
                tax_deferred: true,
                ..taxed.clone()
            },
            false,
        )
        .expect("valid scenario");

        assert!(taxed_result.summary.total_taxes > Decimal::ZERO);
        assert_eq!(deferred_result.summary.total_taxes, Decimal::ZERO);
        assert!(taxed_result.summary.final_balance < deferred_result.summary.final_balance);
        // 8% growth taxed at 25% leaves roughly 6% net growth.
        assert_approx_tol(
            to_f64(taxed_result.summary.final_balance),
            10_000.0 * 1.06_f64.powi(5),
            60.0,
        );
    }

    #[test]
    fn no_tax_on_losses() {
        let scenario = ScenarioInput {
            tax_rate: 0.3,
            ..ScenarioInput::lump_sum(dec!(10000), -0.1, 2)
        };
        let result = project(&scenario, false).expect("valid scenario");
        assert_eq!(result.summary.total_taxes, Decimal::ZERO);
    }

    #[test]
    fn inflation_adjustment_divides_by_cumulative_inflation() {
        let scenario = ScenarioInput {
            inflation_rate: 0.03,
            ..ScenarioInput::lump_sum(dec!(10000), 0.0, 10)
        };
        let result = project(&scenario, false).expect("valid scenario");
        assert_approx_tol(
            to_f64(result.summary.inflation_adjusted_final_balance),
            10_000.0 / 1.03_f64.powi(10),
            0.01,
        );
        assert!(result.summary.real_gain < Decimal::ZERO);
    }

    #[test]
    fn project_is_idempotent() {
        let scenario = ScenarioInput {
            fee_percentage: 0.005,
            tax_rate: 0.2,
            inflation_rate: 0.025,
            ..example_scenario()
        };
        let first = serde_json::to_string(&project(&scenario, true).expect("valid"))
            .expect("serializes");
        let second = serde_json::to_string(&project(&scenario, true).expect("valid"))
            .expect("serializes");
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_scenario_is_rejected_before_projection() {
        let scenario = ScenarioInput {
            tax_rate: 2.0,
            ..example_scenario()
        };
        let err = project(&scenario, false).expect_err("must reject");
        assert!(err.to_string().contains("tax_rate"));
    }

    #[test]
    fn runaway_growth_is_an_overflow_error() {
        let scenario = ScenarioInput::lump_sum(dec!(10000), 5.0, 40);
        let err = project(&scenario, false).expect_err("must not fit");
        assert!(matches!(err, EngineError::Overflow { .. }), "{err}");

        let short = ScenarioInput::lump_sum(dec!(10000), 5.0, 10);
        let result = project(&short, false).expect("fits");
        assert!(result.summary.final_balance <= MAX_BALANCE);
    }

    #[test]
    fn huge_contribution_is_an_overflow_error() {
        let scenario = ScenarioInput {
            contribution_amount: Decimal::MAX,
            ..ScenarioInput::lump_sum(Decimal::ZERO, 0.05, 2)
        };
        let err = project(&scenario, false).expect_err("must not fit");
        assert!(matches!(err, EngineError::Overflow { .. }), "{err}");
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_lump_sum_tracks_closed_form(
            initial in 0u32..2_000_000,
            return_bp in -3_000i32..2_500,
            years in 0u32..40
        ) {
            let scenario = ScenarioInput::lump_sum(Decimal::from(initial), return_bp as f64 / 10_000.0, years);
            let result = project(&scenario, false).expect("valid scenario");
            let expected = initial as f64 * (1.0 + return_bp as f64 / 10_000.0).powi(years as i32);
            let actual = to_f64(result.summary.final_balance);
            let tol = 0.01 * (years as f64 * 12.0 + 1.0) * (1.0 + expected / initial.max(1) as f64);
            prop_assert!((actual - expected).abs() <= tol, "expected {expected}, got {actual}");
            prop_assert_eq!(result.annual_projection.len(), years as usize + 1);
        }

        #[test]
        fn prop_summary_totals_reconcile(
            initial in 0u32..500_000,
            contribution in 0u32..5_000,
            return_bp in -2_000i32..2_000,
            fee_bp in 0u32..300,
            tax_bp in 0u32..4_000,
            years in 1u32..25
        ) {
            let scenario = ScenarioInput {
                contribution_amount: Decimal::from(contribution),
                fee_percentage: fee_bp as f64 / 10_000.0,
                tax_rate: tax_bp as f64 / 10_000.0,
                ..ScenarioInput::lump_sum(Decimal::from(initial), return_bp as f64 / 10_000.0, years)
            };
            let result = project(&scenario, false).expect("valid scenario");
            let s = &result.summary;
            prop_assert_eq!(
                s.final_balance,
                s.total_contributions + s.total_growth - s.total_fees - s.total_taxes
            );
        }
    }
}
