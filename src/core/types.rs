use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::money::{Money, round_cents};
use crate::error::ValidationErrors;

pub const MONTHS_PER_YEAR: u32 = 12;
pub const MIN_RETURN_RATE: f64 = -1.0;
pub const MAX_RETURN_RATE: f64 = 5.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContributionFrequency {
    Weekly,
    #[serde(alias = "biweekly", alias = "bi_weekly", alias = "biWeekly")]
    BiWeekly,
    Monthly,
    Quarterly,
    #[serde(alias = "annual", alias = "yearly")]
    Annually,
    #[serde(alias = "onetime", alias = "one_time", alias = "oneTime")]
    OneTime,
}

impl ContributionFrequency {
    pub fn periods_per_year(self) -> Option<u32> {
        match self {
            ContributionFrequency::Weekly => Some(52),
            ContributionFrequency::BiWeekly => Some(26),
            ContributionFrequency::Monthly => Some(12),
            ContributionFrequency::Quarterly => Some(4),
            ContributionFrequency::Annually => Some(1),
            ContributionFrequency::OneTime => None,
        }
    }

    /// Share of one contribution credited in the given month (0-based from the
    /// start of the projection). Weekly and bi-weekly installments are spread
    /// evenly across months; quarterly and annual ones land in the first month
    /// of their interval.
    fn monthly_multiplier(self, month_index: u32) -> Decimal {
        let month_of_year = month_index % MONTHS_PER_YEAR;
        match self {
            ContributionFrequency::Weekly => Decimal::from(52) / Decimal::from(MONTHS_PER_YEAR),
            ContributionFrequency::BiWeekly => Decimal::from(26) / Decimal::from(MONTHS_PER_YEAR),
            ContributionFrequency::Monthly => Decimal::ONE,
            ContributionFrequency::Quarterly if month_of_year % 3 == 0 => Decimal::ONE,
            ContributionFrequency::Annually if month_of_year == 0 => Decimal::ONE,
            ContributionFrequency::OneTime if month_index == 0 => Decimal::ONE,
            _ => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioInput {
    pub initial_amount: Money,
    pub annual_return_rate: f64,
    pub volatility: Option<f64>,
    pub inflation_rate: f64,
    pub fee_percentage: f64,
    pub tax_rate: f64,
    pub tax_deferred: bool,
    pub time_horizon_years: u32,
    pub contribution_amount: Money,
    pub contribution_frequency: ContributionFrequency,
    pub contribution_growth_rate: f64,
    /// Contributions stop after this many months when set.
    pub contribution_months: Option<u32>,
}

impl ScenarioInput {
    /// A lump sum with no contributions, fees, taxes or inflation.
    pub fn lump_sum(initial_amount: Money, annual_return_rate: f64, time_horizon_years: u32) -> Self {
        Self {
            initial_amount,
            annual_return_rate,
            volatility: None,
            inflation_rate: 0.0,
            fee_percentage: 0.0,
            tax_rate: 0.0,
            tax_deferred: false,
            time_horizon_years,
            contribution_amount: Decimal::ZERO,
            contribution_frequency: ContributionFrequency::Monthly,
            contribution_growth_rate: 0.0,
            contribution_months: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.initial_amount < Decimal::ZERO {
            errors.push("initial_amount", "must be >= 0");
        }
        if self.contribution_amount < Decimal::ZERO {
            errors.push("contribution_amount", "must be >= 0");
        }
        if !self.annual_return_rate.is_finite()
            || !(MIN_RETURN_RATE..=MAX_RETURN_RATE).contains(&self.annual_return_rate)
        {
            errors.push(
                "annual_return_rate",
                format!("must be between {MIN_RETURN_RATE} and {MAX_RETURN_RATE}"),
            );
        }
        if let Some(volatility) = self.volatility {
            if !volatility.is_finite() || volatility < 0.0 {
                errors.push("volatility", "must be >= 0");
            }
        }
        for (field, value) in [
            ("inflation_rate", self.inflation_rate),
            ("fee_percentage", self.fee_percentage),
            ("tax_rate", self.tax_rate),
            ("contribution_growth_rate", self.contribution_growth_rate),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                errors.push(field, "must be between 0 and 1");
            }
        }

        errors.into_result(())
    }

    pub(crate) fn contribution_for_month(&self, month_index: u32, year_amount: Money) -> Money {
        if let Some(limit) = self.contribution_months {
            if month_index >= limit {
                return Decimal::ZERO;
            }
        }
        round_cents(year_amount * self.contribution_frequency.monthly_multiplier(month_index))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodProjection {
    pub period_index: u32,
    pub opening_balance: Money,
    pub contribution_in_period: Money,
    pub growth_in_period: Money,
    pub fees_in_period: Money,
    pub taxes_in_period: Money,
    pub closing_balance: Money,
    pub inflation_adjusted_closing_balance: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSummary {
    pub final_balance: Money,
    /// Initial amount plus every periodic contribution.
    pub total_contributions: Money,
    pub total_growth: Money,
    pub total_fees: Money,
    pub total_taxes: Money,
    pub cagr: Option<f64>,
    pub inflation_adjusted_final_balance: Money,
    pub real_gain: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResult {
    pub summary: ProjectionSummary,
    pub annual_projection: Vec<PeriodProjection>,
    pub monthly_projection: Option<Vec<PeriodProjection>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_scenario() -> ScenarioInput {
        ScenarioInput {
            contribution_amount: dec!(100),
            ..ScenarioInput::lump_sum(dec!(1000), 0.05, 3)
        }
    }

    #[test]
    fn valid_scenario_passes() {
        sample_scenario().validate().expect("valid scenario");
    }

    #[test]
    fn validation_collects_every_bad_field() {
        let mut scenario = sample_scenario();
        scenario.annual_return_rate = 7.0;
        scenario.volatility = Some(-0.1);
        scenario.fee_percentage = 1.5;
        scenario.initial_amount = dec!(-1);

        let errors = scenario.validate().expect_err("must reject");
        assert!(errors.contains_field("annual_return_rate"));
        assert!(errors.contains_field("volatility"));
        assert!(errors.contains_field("fee_percentage"));
        assert!(errors.contains_field("initial_amount"));
        assert_eq!(errors.errors().len(), 4);
    }

    #[test]
    fn negative_return_rate_is_allowed() {
        let mut scenario = sample_scenario();
        scenario.annual_return_rate = -0.3;
        scenario.validate().expect("negative returns are valid");
    }

    #[test]
    fn non_finite_rates_are_rejected() {
        let mut scenario = sample_scenario();
        scenario.inflation_rate = f64::NAN;
        let errors = scenario.validate().expect_err("must reject NaN");
        assert!(errors.contains_field("inflation_rate"));
    }

    #[test]
    fn quarterly_contributions_land_in_first_month_of_quarter() {
        let mut scenario = sample_scenario();
        scenario.contribution_frequency = ContributionFrequency::Quarterly;
        let credited: Vec<Money> = (0..12)
            .map(|m| scenario.contribution_for_month(m, dec!(100)))
            .collect();
        let total: Money = credited.iter().copied().sum();
        assert_eq!(total, dec!(400));
        assert_eq!(credited[0], dec!(100));
        assert_eq!(credited[1], Decimal::ZERO);
        assert_eq!(credited[3], dec!(100));
    }

    #[test]
    fn weekly_contributions_are_spread_evenly() {
        let mut scenario = sample_scenario();
        scenario.contribution_frequency = ContributionFrequency::Weekly;
        assert_eq!(scenario.contribution_for_month(5, dec!(120)), dec!(520));
    }

    #[test]
    fn one_time_contribution_is_credited_once() {
        let mut scenario = sample_scenario();
        scenario.contribution_frequency = ContributionFrequency::OneTime;
        assert_eq!(scenario.contribution_for_month(0, dec!(100)), dec!(100));
        assert_eq!(scenario.contribution_for_month(12, dec!(100)), Decimal::ZERO);
    }

    #[test]
    fn contribution_months_stop_contributions() {
        let mut scenario = sample_scenario();
        scenario.contribution_months = Some(2);
        assert_eq!(scenario.contribution_for_month(1, dec!(100)), dec!(100));
        assert_eq!(scenario.contribution_for_month(2, dec!(100)), Decimal::ZERO);
    }

    #[test]
    fn frequency_parses_aliases() {
        let parsed: ContributionFrequency = serde_json::from_str("\"bi-weekly\"").expect("parses");
        assert_eq!(parsed, ContributionFrequency::BiWeekly);
        let parsed: ContributionFrequency = serde_json::from_str("\"one_time\"").expect("parses");
        assert_eq!(parsed, ContributionFrequency::OneTime);
    }
}
