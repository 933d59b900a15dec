//! Tax-year tables for the withholding calculator. Built-in values are the
//! 2024 federal schedules, FICA parameters and a selection of state schedules;
//! a TOML file with the same shape replaces them wholesale.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::money::{Money, round_cents};
use crate::error::{EngineError, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilingStatus {
    Single,
    #[serde(alias = "married", alias = "marriedFilingJointly", alias = "married_filing_jointly")]
    MarriedFilingJointly,
    #[serde(alias = "marriedFilingSeparately", alias = "married_filing_separately")]
    MarriedFilingSeparately,
    #[serde(alias = "headOfHousehold", alias = "head_of_household")]
    HeadOfHousehold,
}

pub const FILING_STATUSES: [FilingStatus; 4] = [
    FilingStatus::Single,
    FilingStatus::MarriedFilingJointly,
    FilingStatus::MarriedFilingSeparately,
    FilingStatus::HeadOfHousehold,
];

/// Income up to `up_to` (exclusive of lower brackets) is taxed at `rate`.
/// The top bracket has no ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBracket {
    #[serde(default)]
    pub up_to: Option<Money>,
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederalSchedule {
    pub standard_deduction: Money,
    pub brackets: Vec<TaxBracket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FicaTable {
    pub social_security_rate: Decimal,
    pub social_security_wage_base: Money,
    pub medicare_rate: Decimal,
    pub additional_medicare_rate: Decimal,
    pub additional_medicare_thresholds: BTreeMap<FilingStatus, Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StateTax {
    None,
    #[serde(rename_all = "camelCase")]
    Flat {
        rate: Decimal,
        #[serde(default)]
        standard_deduction: Money,
    },
    #[serde(rename_all = "camelCase")]
    Progressive {
        brackets: Vec<TaxBracket>,
        #[serde(default)]
        standard_deduction: Money,
    },
}

impl StateTax {
    pub fn annual_tax(&self, taxable_wages: Money) -> Money {
        match self {
            StateTax::None => Decimal::ZERO,
            StateTax::Flat {
                rate,
                standard_deduction,
            } => round_cents((taxable_wages - standard_deduction).max(Decimal::ZERO) * rate),
            StateTax::Progressive {
                brackets,
                standard_deduction,
            } => progressive_tax((taxable_wages - standard_deduction).max(Decimal::ZERO), brackets),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxTables {
    pub tax_year: u16,
    pub federal: BTreeMap<FilingStatus, FederalSchedule>,
    pub fica: FicaTable,
    pub elective_deferral_limit: Money,
    pub catch_up_limit: Money,
    /// Withholding allowance value subtracted per claimed allowance.
    pub allowance_value: Money,
    /// Two-letter upper-case state codes.
    pub states: BTreeMap<String, StateTax>,
}

impl TaxTables {
    pub fn federal(&self, status: FilingStatus) -> Result<&FederalSchedule> {
        self.federal.get(&status).ok_or_else(|| EngineError::Table {
            table: "tax",
            reason: format!("no federal schedule for {status:?}"),
        })
    }

    pub fn state(&self, code: &str) -> Option<&StateTax> {
        self.states.get(code.trim().to_ascii_uppercase().as_str())
    }

    pub fn additional_medicare_threshold(&self, status: FilingStatus) -> Money {
        self.fica
            .additional_medicare_thresholds
            .get(&status)
            .copied()
            .unwrap_or(dec!(200000))
    }

    pub fn validate(&self) -> Result<()> {
        for status in FILING_STATUSES {
            let schedule = self.federal(status)?;
            validate_brackets(&format!("federal {status:?}"), &schedule.brackets)?;
            if schedule.standard_deduction < Decimal::ZERO {
                return Err(table_error(format!("federal {status:?} standard deduction is negative")));
            }
        }
        for (code, state) in &self.states {
            if code.len() != 2 || code.chars().any(|c| !c.is_ascii_uppercase()) {
                return Err(table_error(format!("state code {code:?} must be two upper-case letters")));
            }
            match state {
                StateTax::None => {}
                StateTax::Flat { rate, .. } => validate_rate(&format!("state {code}"), *rate)?,
                StateTax::Progressive { brackets, .. } => {
                    validate_brackets(&format!("state {code}"), brackets)?
                }
            }
        }
        for (name, rate) in [
            ("social security", self.fica.social_security_rate),
            ("medicare", self.fica.medicare_rate),
            ("additional medicare", self.fica.additional_medicare_rate),
        ] {
            validate_rate(name, rate)?;
        }
        if self.elective_deferral_limit < Decimal::ZERO || self.catch_up_limit < Decimal::ZERO {
            return Err(table_error("contribution limits must be >= 0".to_string()));
        }
        Ok(())
    }
}

/// Cumulative marginal tax: each bracket's rate applies only to the slice of
/// income that falls inside it.
pub fn progressive_tax(income: Money, brackets: &[TaxBracket]) -> Money {
    let mut tax = Decimal::ZERO;
    let mut floor = Decimal::ZERO;
    for bracket in brackets {
        if income <= floor {
            break;
        }
        let ceiling = bracket.up_to.map_or(income, |cap| cap.min(income));
        tax += (ceiling - floor) * bracket.rate;
        match bracket.up_to {
            Some(cap) => floor = cap,
            None => break,
        }
    }
    round_cents(tax)
}

fn validate_rate(name: &str, rate: Decimal) -> Result<()> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        return Err(table_error(format!("{name} rate {rate} must be between 0 and 1")));
    }
    Ok(())
}

fn validate_brackets(name: &str, brackets: &[TaxBracket]) -> Result<()> {
    let Some(last) = brackets.last() else {
        return Err(table_error(format!("{name} has no brackets")));
    };
    if last.up_to.is_some() {
        return Err(table_error(format!("{name} top bracket must be open-ended")));
    }
    let mut previous = Decimal::ZERO;
    for bracket in &brackets[..brackets.len() - 1] {
        match bracket.up_to {
            Some(cap) if cap > previous => previous = cap,
            _ => {
                return Err(table_error(format!(
                    "{name} bracket ceilings must be strictly increasing"
                )));
            }
        }
    }
    for bracket in brackets {
        validate_rate(name, bracket.rate)?;
    }
    Ok(())
}

fn table_error(reason: String) -> EngineError {
    EngineError::Table {
        table: "tax",
        reason,
    }
}

fn brackets(rates: &[Decimal], ceilings: &[Decimal]) -> Vec<TaxBracket> {
    rates
        .iter()
        .enumerate()
        .map(|(i, &rate)| TaxBracket {
            up_to: ceilings.get(i).copied(),
            rate,
        })
        .collect()
}

const FEDERAL_RATES: [Decimal; 7] = [
    dec!(0.10),
    dec!(0.12),
    dec!(0.22),
    dec!(0.24),
    dec!(0.32),
    dec!(0.35),
    dec!(0.37),
];

fn federal(standard_deduction: Money, ceilings: [Decimal; 6]) -> FederalSchedule {
    FederalSchedule {
        standard_deduction,
        brackets: brackets(&FEDERAL_RATES, &ceilings),
    }
}

impl Default for TaxTables {
    fn default() -> Self {
        let federal = BTreeMap::from([
            (
                FilingStatus::Single,
                federal(
                    dec!(14600),
                    [dec!(11600), dec!(47150), dec!(100525), dec!(191950), dec!(243725), dec!(609350)],
                ),
            ),
            (
                FilingStatus::MarriedFilingJointly,
                federal(
                    dec!(29200),
                    [dec!(23200), dec!(94300), dec!(201050), dec!(383900), dec!(487450), dec!(731200)],
                ),
            ),
            (
                FilingStatus::MarriedFilingSeparately,
                federal(
                    dec!(14600),
                    [dec!(11600), dec!(47150), dec!(100525), dec!(191950), dec!(243725), dec!(365600)],
                ),
            ),
            (
                FilingStatus::HeadOfHousehold,
                federal(
                    dec!(21900),
                    [dec!(16550), dec!(63100), dec!(100500), dec!(191950), dec!(243700), dec!(609350)],
                ),
            ),
        ]);

        let fica = FicaTable {
            social_security_rate: dec!(0.062),
            social_security_wage_base: dec!(168600),
            medicare_rate: dec!(0.0145),
            additional_medicare_rate: dec!(0.009),
            additional_medicare_thresholds: BTreeMap::from([
                (FilingStatus::Single, dec!(200000)),
                (FilingStatus::MarriedFilingJointly, dec!(250000)),
                (FilingStatus::MarriedFilingSeparately, dec!(125000)),
                (FilingStatus::HeadOfHousehold, dec!(200000)),
            ]),
        };

        let mut states = BTreeMap::new();
        states.insert(
            "CA".to_string(),
            StateTax::Progressive {
                brackets: brackets(
                    &[
                        dec!(0.01),
                        dec!(0.02),
                        dec!(0.04),
                        dec!(0.06),
                        dec!(0.08),
                        dec!(0.093),
                        dec!(0.103),
                        dec!(0.113),
                        dec!(0.123),
                    ],
                    &[
                        dec!(10756),
                        dec!(25499),
                        dec!(40245),
                        dec!(55866),
                        dec!(70606),
                        dec!(360659),
                        dec!(432787),
                        dec!(721314),
                    ],
                ),
                standard_deduction: dec!(5540),
            },
        );
        states.insert(
            "NY".to_string(),
            StateTax::Progressive {
                brackets: brackets(
                    &[
                        dec!(0.04),
                        dec!(0.045),
                        dec!(0.0525),
                        dec!(0.055),
                        dec!(0.06),
                        dec!(0.0685),
                        dec!(0.0965),
                        dec!(0.103),
                        dec!(0.109),
                    ],
                    &[
                        dec!(8500),
                        dec!(11700),
                        dec!(13900),
                        dec!(80650),
                        dec!(215400),
                        dec!(1077550),
                        dec!(5000000),
                        dec!(25000000),
                    ],
                ),
                standard_deduction: dec!(8000),
            },
        );
        for (code, rate, standard_deduction) in [
            ("IL", dec!(0.0495), dec!(2775)),
            ("PA", dec!(0.0307), Decimal::ZERO),
            ("MA", dec!(0.05), dec!(4400)),
            ("CO", dec!(0.0425), Decimal::ZERO),
            ("NC", dec!(0.045), dec!(12750)),
        ] {
            states.insert(
                code.to_string(),
                StateTax::Flat {
                    rate,
                    standard_deduction,
                },
            );
        }
        for code in ["TX", "FL", "WA", "NV", "TN", "SD", "WY", "AK", "NH"] {
            states.insert(code.to_string(), StateTax::None);
        }

        Self {
            tax_year: 2024,
            federal,
            fica,
            elective_deferral_limit: dec!(23000),
            catch_up_limit: dec!(7500),
            allowance_value: dec!(4300),
            states,
        }
    }
}
