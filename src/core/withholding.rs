//! Per-paycheck withholding estimate and the retirement-options comparator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::money::{Money, rate, round_cents, to_f64};
use super::tax_tables::{FilingStatus, TaxTables, progressive_tax};
use crate::error::{Result, ValidationErrors};

pub const MAX_ALLOWANCES: u32 = 20;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayFrequency {
    Weekly,
    #[serde(alias = "biweekly", alias = "bi_weekly", alias = "biWeekly")]
    BiWeekly,
    #[serde(alias = "semimonthly", alias = "semi_monthly", alias = "semiMonthly")]
    SemiMonthly,
    Monthly,
    #[serde(alias = "annual", alias = "yearly")]
    Annually,
}

impl PayFrequency {
    pub fn periods_per_year(self) -> u32 {
        match self {
            PayFrequency::Weekly => 52,
            PayFrequency::BiWeekly => 26,
            PayFrequency::SemiMonthly => 24,
            PayFrequency::Monthly => 12,
            PayFrequency::Annually => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContributionAmount {
    /// Fraction of gross salary.
    Percentage { rate: f64 },
    #[serde(rename_all = "camelCase")]
    Fixed { per_period: Money },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaxTreatment {
    #[serde(alias = "pretax", alias = "pre_tax", alias = "traditional")]
    PreTax,
    Roth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetirementElection {
    #[serde(default)]
    pub label: String,
    pub amount: ContributionAmount,
    pub treatment: TaxTreatment,
    /// Employer contribution per dollar the employee contributes.
    #[serde(default)]
    pub employer_match_rate: f64,
    /// Share of salary the employer matches up to.
    #[serde(default)]
    pub employer_match_cap: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithholdingInput {
    pub annual_salary: Money,
    pub filing_status: FilingStatus,
    pub pay_frequency: PayFrequency,
    pub state: String,
    pub allowances: u32,
    pub elections: Vec<RetirementElection>,
    pub catch_up_eligible: bool,
    /// Extra federal withholding per paycheck.
    pub additional_withholding: Money,
    pub other_income: Money,
    pub itemized_deductions: Money,
    pub tax_credits: Money,
}

impl WithholdingInput {
    pub fn new(
        annual_salary: Money,
        filing_status: FilingStatus,
        pay_frequency: PayFrequency,
        state: impl Into<String>,
    ) -> Self {
        Self {
            annual_salary,
            filing_status,
            pay_frequency,
            state: state.into(),
            allowances: 0,
            elections: Vec::new(),
            catch_up_eligible: false,
            additional_withholding: Decimal::ZERO,
            other_income: Decimal::ZERO,
            itemized_deductions: Decimal::ZERO,
            tax_credits: Decimal::ZERO,
        }
    }

    pub fn validate(&self, tables: &TaxTables) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.annual_salary <= Decimal::ZERO {
            errors.push("annual_salary", "must be > 0");
        }
        if tables.state(&self.state).is_none() {
            errors.push("state", format!("unknown state code {:?}", self.state));
        }
        if self.allowances > MAX_ALLOWANCES {
            errors.push("allowances", format!("must be <= {MAX_ALLOWANCES}"));
        }
        for (field, value) in [
            ("additional_withholding", self.additional_withholding),
            ("other_income", self.other_income),
            ("itemized_deductions", self.itemized_deductions),
            ("tax_credits", self.tax_credits),
        ] {
            if value < Decimal::ZERO {
                errors.push(field, "must be >= 0");
            }
        }
        for election in &self.elections {
            errors.extend(validate_election(election));
        }
        errors.into_result(())
    }
}

pub(crate) fn validate_election(election: &RetirementElection) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    match election.amount {
        ContributionAmount::Percentage { rate } => {
            if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
                errors.push("contribution_rate", "must be between 0 and 1");
            }
        }
        ContributionAmount::Fixed { per_period } => {
            if per_period < Decimal::ZERO {
                errors.push("contribution_per_period", "must be >= 0");
            }
        }
    }
    if !election.employer_match_rate.is_finite() || !(0.0..=1.0).contains(&election.employer_match_rate) {
        errors.push("employer_match_rate", "must be between 0 and 1");
    }
    if !election.employer_match_cap.is_finite() || !(0.0..=1.0).contains(&election.employer_match_cap) {
        errors.push("employer_match_cap", "must be between 0 and 1");
    }
    errors
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionOutcome {
    pub label: String,
    pub treatment: TaxTreatment,
    pub requested_annual: Money,
    pub annual_contribution: Money,
    pub per_period: Money,
    pub employer_match_annual: Money,
    /// True when the elective-deferral limit cut the request.
    pub limited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaycheckEstimate {
    pub pay_periods: u32,
    pub gross_pay: Money,
    pub federal_withholding: Money,
    pub state_withholding: Money,
    pub social_security: Money,
    pub medicare: Money,
    pub additional_medicare: Money,
    pub pre_tax_contributions: Money,
    pub post_tax_contributions: Money,
    pub net_pay: Money,
    pub annual_gross: Money,
    pub annual_taxable_wages: Money,
    pub annual_federal_withholding: Money,
    pub annual_state_withholding: Money,
    pub annual_fica: Money,
    pub annual_employer_match: Money,
    pub elective_deferral_limit: Money,
    pub elections: Vec<ElectionOutcome>,
    pub estimated_federal_liability: Money,
    /// Positive for a refund, negative when tax is owed.
    pub estimated_refund: Money,
    /// Total taxes withheld as a share of gross pay.
    pub effective_withholding_rate: f64,
}

impl PaycheckEstimate {
    pub fn annual_taxes(&self) -> Money {
        self.annual_federal_withholding + self.annual_state_withholding + self.annual_fica
    }
}

pub fn estimate_withholding(input: &WithholdingInput, tables: &TaxTables) -> Result<PaycheckEstimate> {
    input.validate(tables)?;
    let estimate = compute(input, tables, input.additional_withholding)?;
    debug!(
        net_pay = %estimate.net_pay,
        refund = %estimate.estimated_refund,
        "estimated paycheck"
    );
    Ok(estimate)
}

/// Estimate for an already validated input. `additional` may be negative,
/// which the optimizer uses to probe reduced withholding; federal
/// withholding never drops below zero.
pub(crate) fn compute(
    input: &WithholdingInput,
    tables: &TaxTables,
    additional: Money,
) -> Result<PaycheckEstimate> {
    let periods = input.pay_frequency.periods_per_year();
    let n = Decimal::from(periods);
    let salary = input.annual_salary;
    let gross_pay = round_cents(salary / n);

    let limit = tables.elective_deferral_limit
        + if input.catch_up_eligible {
            tables.catch_up_limit
        } else {
            Decimal::ZERO
        };
    let mut remaining = limit;
    let mut elections = Vec::with_capacity(input.elections.len());
    for election in &input.elections {
        let requested_annual = match election.amount {
            ContributionAmount::Percentage { rate: share } => round_cents(salary * rate(share)),
            ContributionAmount::Fixed { per_period } => per_period * n,
        };
        let annual_contribution = requested_annual.min(remaining).max(Decimal::ZERO);
        remaining -= annual_contribution;

        let employee_share = annual_contribution / salary;
        let matched_share = employee_share.min(rate(election.employer_match_cap));
        elections.push(ElectionOutcome {
            label: election.label.clone(),
            treatment: election.treatment,
            requested_annual,
            annual_contribution,
            per_period: round_cents(annual_contribution / n),
            employer_match_annual: round_cents(
                salary * matched_share * rate(election.employer_match_rate),
            ),
            limited: annual_contribution < requested_annual,
        });
    }

    let by_treatment = |treatment: TaxTreatment, pick: fn(&ElectionOutcome) -> Money| -> Money {
        elections
            .iter()
            .filter(|e| e.treatment == treatment)
            .map(pick)
            .sum()
    };
    let annual_pre_tax = by_treatment(TaxTreatment::PreTax, |e| e.annual_contribution);
    let pre_tax_contributions = by_treatment(TaxTreatment::PreTax, |e| e.per_period);
    let post_tax_contributions = by_treatment(TaxTreatment::Roth, |e| e.per_period);
    let annual_employer_match: Money = elections.iter().map(|e| e.employer_match_annual).sum();

    let taxable_wages = (salary - annual_pre_tax).max(Decimal::ZERO);
    let schedule = tables.federal(input.filing_status)?;

    let withholding_base = taxable_wages
        - schedule.standard_deduction
        - tables.allowance_value * Decimal::from(input.allowances);
    let wage_tax = progressive_tax(withholding_base.max(Decimal::ZERO), &schedule.brackets);
    let federal_withholding = (round_cents(wage_tax / n) + additional).max(Decimal::ZERO);

    let state_tax = tables
        .state(&input.state)
        .map(|state| state.annual_tax(taxable_wages))
        .unwrap_or(Decimal::ZERO);
    let state_withholding = round_cents(state_tax / n);

    let fica = &tables.fica;
    let social_security =
        round_cents(salary.min(fica.social_security_wage_base) * fica.social_security_rate / n);
    let medicare = round_cents(salary * fica.medicare_rate / n);
    let additional_medicare = round_cents(
        (salary - tables.additional_medicare_threshold(input.filing_status)).max(Decimal::ZERO)
            * fica.additional_medicare_rate
            / n,
    );

    let net_pay = gross_pay
        - federal_withholding
        - state_withholding
        - social_security
        - medicare
        - additional_medicare
        - pre_tax_contributions
        - post_tax_contributions;

    let deduction = schedule.standard_deduction.max(input.itemized_deductions);
    let liability_base = taxable_wages + input.other_income - deduction;
    let estimated_federal_liability = (progressive_tax(liability_base.max(Decimal::ZERO), &schedule.brackets)
        - input.tax_credits)
        .max(Decimal::ZERO);
    let annual_federal_withholding = federal_withholding * n;
    let annual_state_withholding = state_withholding * n;
    let annual_fica = (social_security + medicare + additional_medicare) * n;

    let withheld_per_period =
        federal_withholding + state_withholding + social_security + medicare + additional_medicare;
    let effective_withholding_rate = if gross_pay.is_zero() {
        0.0
    } else {
        to_f64(withheld_per_period / gross_pay)
    };

    Ok(PaycheckEstimate {
        pay_periods: periods,
        gross_pay,
        federal_withholding,
        state_withholding,
        social_security,
        medicare,
        additional_medicare,
        pre_tax_contributions,
        post_tax_contributions,
        net_pay,
        annual_gross: salary,
        annual_taxable_wages: taxable_wages,
        annual_federal_withholding,
        annual_state_withholding,
        annual_fica,
        annual_employer_match,
        elective_deferral_limit: limit,
        elections,
        estimated_federal_liability,
        estimated_refund: annual_federal_withholding - estimated_federal_liability,
        effective_withholding_rate,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetirementOptionOutcome {
    pub label: String,
    pub treatment: TaxTreatment,
    pub employee_contribution_annual: Money,
    pub employer_match_annual: Money,
    /// Employee plus employer money going into the account each year.
    pub total_saved_annual: Money,
    /// Annual withholding avoided relative to contributing nothing.
    pub tax_savings_annual: Money,
    pub net_pay: Money,
    pub net_pay_change: Money,
    /// Take-home pay given up per year for this option.
    pub net_cost_annual: Money,
    pub limited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetirementComparison {
    pub baseline_net_pay: Money,
    pub baseline_annual_taxes: Money,
    pub options: Vec<RetirementOptionOutcome>,
    /// Label of the option with the most money saved per dollar of take-home
    /// pay given up.
    pub most_efficient: Option<String>,
}

/// Compares each option on its own against contributing nothing. Elections
/// already on `input` are ignored.
pub fn compare_retirement_options(
    input: &WithholdingInput,
    options: &[RetirementElection],
    tables: &TaxTables,
) -> Result<RetirementComparison> {
    let baseline_input = WithholdingInput {
        elections: Vec::new(),
        ..input.clone()
    };
    let mut errors = match baseline_input.validate(tables) {
        Ok(()) => ValidationErrors::new(),
        Err(errors) => errors,
    };
    if options.is_empty() {
        errors.push("options", "at least one retirement option is required");
    }
    for option in options {
        errors.extend(validate_election(option));
    }
    errors.into_result(())?;

    let baseline = compute(&baseline_input, tables, baseline_input.additional_withholding)?;
    let baseline_annual_taxes = baseline.annual_taxes();
    let n = Decimal::from(baseline.pay_periods);

    let mut outcomes = Vec::with_capacity(options.len());
    for (index, option) in options.iter().enumerate() {
        let scenario = WithholdingInput {
            elections: vec![option.clone()],
            ..baseline_input.clone()
        };
        let estimate = compute(&scenario, tables, scenario.additional_withholding)?;
        let election = estimate.elections.first();
        let employee = election.map_or(Decimal::ZERO, |e| e.annual_contribution);
        let employer = election.map_or(Decimal::ZERO, |e| e.employer_match_annual);
        let label = if option.label.trim().is_empty() {
            format!("option {}", index + 1)
        } else {
            option.label.clone()
        };
        let net_pay_change = estimate.net_pay - baseline.net_pay;
        outcomes.push(RetirementOptionOutcome {
            label,
            treatment: option.treatment,
            employee_contribution_annual: employee,
            employer_match_annual: employer,
            total_saved_annual: employee + employer,
            tax_savings_annual: baseline_annual_taxes - estimate.annual_taxes(),
            net_pay: estimate.net_pay,
            net_pay_change,
            net_cost_annual: -net_pay_change * n,
            limited: election.is_some_and(|e| e.limited),
        });
    }

    let most_efficient = outcomes
        .iter()
        .filter(|o| o.net_cost_annual > Decimal::ZERO)
        .max_by(|a, b| {
            (a.total_saved_annual / a.net_cost_annual).cmp(&(b.total_saved_annual / b.net_cost_annual))
        })
        .map(|o| o.label.clone());

    Ok(RetirementComparison {
        baseline_net_pay: baseline.net_pay,
        baseline_annual_taxes,
        options: outcomes,
        most_efficient,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn single_texan(salary: Money) -> WithholdingInput {
        WithholdingInput::new(salary, FilingStatus::Single, PayFrequency::Monthly, "TX")
    }

    fn pre_tax_percent(share: f64) -> RetirementElection {
        RetirementElection {
            label: format!("{:.0}% traditional", share * 100.0),
            amount: ContributionAmount::Percentage { rate: share },
            treatment: TaxTreatment::PreTax,
            employer_match_rate: 0.5,
            employer_match_cap: 0.06,
        }
    }

    #[test]
    fn federal_withholding_uses_lowest_bracket() {
        // 24,600 - 14,600 standard deduction = 10,000 taxable at 10%.
        let tables = TaxTables::default();
        let estimate = estimate_withholding(&single_texan(dec!(24600)), &tables).expect("estimates");
        assert_eq!(estimate.gross_pay, dec!(2050));
        assert_eq!(estimate.federal_withholding, dec!(83.33));
        assert_eq!(estimate.annual_federal_withholding, dec!(999.96));
        assert_eq!(estimate.state_withholding, Decimal::ZERO);
    }

    #[test]
    fn federal_withholding_spans_two_brackets() {
        let tables = TaxTables::default();
        let mut input = single_texan(dec!(34600));
        input.pay_frequency = PayFrequency::Annually;
        let estimate = estimate_withholding(&input, &tables).expect("estimates");
        assert_eq!(estimate.federal_withholding, dec!(2168));
    }

    #[test]
    fn fica_caps_social_security_and_adds_medicare_surtax() {
        let tables = TaxTables::default();
        let mut input = single_texan(dec!(300000));
        input.pay_frequency = PayFrequency::Annually;
        let estimate = estimate_withholding(&input, &tables).expect("estimates");
        assert_eq!(estimate.social_security, dec!(10453.20));
        assert_eq!(estimate.medicare, dec!(4350));
        assert_eq!(estimate.additional_medicare, dec!(900));
    }

    #[test]
    fn net_pay_reconciles_with_deductions() {
        let tables = TaxTables::default();
        let mut input = WithholdingInput::new(
            dec!(85000),
            FilingStatus::MarriedFilingJointly,
            PayFrequency::BiWeekly,
            "ca",
        );
        input.elections = vec![
            pre_tax_percent(0.06),
            RetirementElection {
                label: "roth".to_string(),
                amount: ContributionAmount::Fixed { per_period: dec!(100) },
                treatment: TaxTreatment::Roth,
                employer_match_rate: 0.0,
                employer_match_cap: 0.0,
            },
        ];
        let e = estimate_withholding(&input, &tables).expect("estimates");
        assert_eq!(
            e.net_pay,
            e.gross_pay
                - e.federal_withholding
                - e.state_withholding
                - e.social_security
                - e.medicare
                - e.additional_medicare
                - e.pre_tax_contributions
                - e.post_tax_contributions
        );
        assert_eq!(e.post_tax_contributions, dec!(100));
        assert_eq!(e.annual_taxable_wages, dec!(85000) - dec!(5100));
        assert!(e.state_withholding > Decimal::ZERO);
    }

    #[test]
    fn employer_match_never_reduces_net_pay() {
        let tables = TaxTables::default();
        let mut with_match = single_texan(dec!(60000));
        with_match.elections = vec![pre_tax_percent(0.10)];
        let mut without_match = with_match.clone();
        without_match.elections[0].employer_match_rate = 0.0;

        let a = estimate_withholding(&with_match, &tables).expect("estimates");
        let b = estimate_withholding(&without_match, &tables).expect("estimates");
        assert_eq!(a.net_pay, b.net_pay);
        // Matched up to 6% of salary at 50 cents on the dollar.
        assert_eq!(a.annual_employer_match, dec!(1800));
        assert_eq!(b.annual_employer_match, Decimal::ZERO);
    }

    #[test]
    fn pre_tax_contributions_are_capped_by_deferral_limit() {
        let tables = TaxTables::default();
        let mut input = single_texan(dec!(200000));
        input.elections = vec![pre_tax_percent(0.25)];
        let capped = estimate_withholding(&input, &tables).expect("estimates");
        assert_eq!(capped.elections[0].annual_contribution, dec!(23000));
        assert!(capped.elections[0].limited);

        input.catch_up_eligible = true;
        let catch_up = estimate_withholding(&input, &tables).expect("estimates");
        assert_eq!(catch_up.elections[0].annual_contribution, dec!(30500));
    }

    #[test]
    fn roth_and_pre_tax_share_one_limit() {
        let tables = TaxTables::default();
        let mut input = single_texan(dec!(200000));
        input.elections = vec![
            pre_tax_percent(0.10),
            RetirementElection {
                treatment: TaxTreatment::Roth,
                ..pre_tax_percent(0.10)
            },
        ];
        let e = estimate_withholding(&input, &tables).expect("estimates");
        assert_eq!(e.elections[0].annual_contribution, dec!(20000));
        assert_eq!(e.elections[1].annual_contribution, dec!(3000));
    }

    #[test]
    fn liability_inputs_move_the_refund() {
        let tables = TaxTables::default();
        let base = estimate_withholding(&single_texan(dec!(70000)), &tables).expect("estimates");

        let mut with_credits = single_texan(dec!(70000));
        with_credits.tax_credits = dec!(2000);
        let credited = estimate_withholding(&with_credits, &tables).expect("estimates");
        assert_eq!(credited.estimated_refund - base.estimated_refund, dec!(2000));

        let mut side_income = single_texan(dec!(70000));
        side_income.other_income = dec!(10000);
        let owed = estimate_withholding(&side_income, &tables).expect("estimates");
        assert!(owed.estimated_refund < base.estimated_refund);
    }

    #[test]
    fn unknown_state_and_bad_rates_are_reported_together() {
        let tables = TaxTables::default();
        let mut input = single_texan(Decimal::ZERO);
        input.state = "ZZ".to_string();
        input.elections = vec![pre_tax_percent(1.5)];
        let err = estimate_withholding(&input, &tables).expect_err("must reject");
        let message = err.to_string();
        assert!(message.contains("annual_salary"));
        assert!(message.contains("state"));
        assert!(message.contains("contribution_rate"));
    }

    #[test]
    fn pre_tax_option_saves_tax_relative_to_baseline() {
        let tables = TaxTables::default();
        let input = WithholdingInput::new(dec!(90000), FilingStatus::Single, PayFrequency::Monthly, "IL");
        let options = vec![
            pre_tax_percent(0.06),
            RetirementElection {
                label: "roth 6%".to_string(),
                treatment: TaxTreatment::Roth,
                ..pre_tax_percent(0.06)
            },
        ];
        let comparison = compare_retirement_options(&input, &options, &tables).expect("compares");
        let traditional = &comparison.options[0];
        let roth = &comparison.options[1];

        assert_eq!(traditional.employee_contribution_annual, dec!(5400));
        assert_eq!(traditional.employer_match_annual, dec!(2700));
        assert!(traditional.tax_savings_annual > Decimal::ZERO);
        assert_eq!(roth.tax_savings_annual, Decimal::ZERO);
        assert!(traditional.net_pay > roth.net_pay);
        assert_eq!(comparison.most_efficient.as_deref(), Some(traditional.label.as_str()));
    }

    #[test]
    fn comparator_requires_options() {
        let tables = TaxTables::default();
        let err = compare_retirement_options(&single_texan(dec!(50000)), &[], &tables)
            .expect_err("must reject");
        assert!(err.to_string().contains("options"));
    }

    #[test]
    fn election_parses_from_json() {
        let election: RetirementElection = serde_json::from_str(
            r#"{"label":"401k","amount":{"type":"fixed","perPeriod":250},"treatment":"pre-tax","employerMatchRate":1.0,"employerMatchCap":0.04}"#,
        )
        .expect("parses");
        assert_eq!(election.amount, ContributionAmount::Fixed { per_period: dec!(250) });
        assert_eq!(election.treatment, TaxTreatment::PreTax);
    }
}
