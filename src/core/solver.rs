use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, warn};

use super::money::{Money, round_cents};
use super::projector::project;
use super::tax_tables::TaxTables;
use super::types::{ContributionFrequency, ScenarioInput};
use super::withholding::{PaycheckEstimate, WithholdingInput, compute};
use crate::error::{Result, ValidationErrors};

pub const DEFAULT_MAX_ITERATIONS: u32 = 64;
pub const DEFAULT_REFUND_TOLERANCE: Money = dec!(1);
pub const DEFAULT_CONTRIBUTION_TOLERANCE: Money = dec!(0.01);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: Money,
    pub upper_bound: Money,
    pub candidate_value: Money,
    pub achieved: Money,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    /// Acceptable distance between the achieved and the target refund.
    pub tolerance: Money,
    pub max_iterations: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_REFUND_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithholdingOptimization {
    pub target_refund: Money,
    pub baseline_refund: Money,
    /// Recommended additional federal withholding per paycheck. Negative
    /// values mean withholding should be reduced.
    pub additional_withholding: Money,
    pub change_per_period: Money,
    pub achieved_refund: Money,
    pub estimate: PaycheckEstimate,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

pub fn optimize_withholding(
    input: &WithholdingInput,
    target_refund: Money,
    tables: &TaxTables,
    config: OptimizerConfig,
) -> Result<WithholdingOptimization> {
    let mut errors = match input.validate(tables) {
        Ok(()) => ValidationErrors::new(),
        Err(errors) => errors,
    };
    validate_optimizer_config(config, &mut errors);
    errors.into_result(())?;

    let current = input.additional_withholding;
    let estimate_at =
        |additional: Money| -> Result<PaycheckEstimate> { compute(input, tables, additional) };
    let baseline = estimate_at(current)?;
    let within = |refund: Money| (refund - target_refund).abs() <= config.tolerance;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let mut converged = false;
    let feasible;
    let message;
    let best;

    if within(baseline.estimated_refund) {
        converged = true;
        feasible = true;
        message = "Current withholding already meets the target refund.".to_string();
        best = (current, baseline.clone());
    } else {
        let unadjusted = estimate_at(Decimal::ZERO)?;
        let mut lo = -unadjusted.federal_withholding;
        let mut hi = unadjusted.net_pay;
        let low_eval = estimate_at(lo)?;
        let high_eval = estimate_at(hi)?;

        if low_eval.estimated_refund > target_refund + config.tolerance {
            feasible = false;
            message = "Target refund is below what withholding nothing produces.".to_string();
            best = (lo, low_eval);
        } else if high_eval.estimated_refund + config.tolerance < target_refund {
            feasible = false;
            message = "Target refund exceeds what withholding the entire paycheck produces."
                .to_string();
            best = (hi, high_eval);
        } else {
            let mut lo_eval = low_eval;
            let mut hi_eval = high_eval;
            let mut solved = None;
            let mut exhausted = false;
            let mut it = 0;
            while it < config.max_iterations {
                it += 1;
                let mid = round_cents((lo + hi) / Decimal::TWO);
                if mid == lo || mid == hi {
                    // Bounds are a cent apart; nothing finer to try.
                    exhausted = true;
                    break;
                }
                let eval = estimate_at(mid)?;
                iterations.push(SolveIteration {
                    iteration: it,
                    lower_bound: lo,
                    upper_bound: hi,
                    candidate_value: mid,
                    achieved: eval.estimated_refund,
                });

                if within(eval.estimated_refund) {
                    solved = Some((mid, eval));
                    break;
                }
                if eval.estimated_refund < target_refund {
                    lo = mid;
                    lo_eval = eval;
                } else {
                    hi = mid;
                    hi_eval = eval;
                }
            }
            best = solved.unwrap_or_else(|| {
                let gap = |e: &PaycheckEstimate| (e.estimated_refund - target_refund).abs();
                if gap(&lo_eval) <= gap(&hi_eval) {
                    (lo, lo_eval)
                } else {
                    (hi, hi_eval)
                }
            });
            converged = within(best.1.estimated_refund);
            feasible = true;
            message = if converged {
                "Solved additional withholding for the target refund.".to_string()
            } else if exhausted {
                "No one-cent withholding step lands within tolerance; returning the closest refund."
                    .to_string()
            } else {
                "Reached max iterations before tolerance was met; returning best estimate."
                    .to_string()
            };
        }
    }

    let (additional_withholding, estimate) = best;
    if converged {
        debug!(
            %additional_withholding,
            iterations = iterations.len(),
            "withholding optimizer converged"
        );
    } else {
        warn!(%target_refund, feasible, "withholding optimizer did not converge");
    }

    Ok(WithholdingOptimization {
        target_refund,
        baseline_refund: baseline.estimated_refund,
        additional_withholding,
        change_per_period: additional_withholding - current,
        achieved_refund: estimate.estimated_refund,
        estimate,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalSolveConfig {
    pub target_balance: Money,
    pub search_min: Money,
    /// Defaults to the target balance.
    pub search_max: Option<Money>,
    pub tolerance: Money,
    pub max_iterations: u32,
}

impl GoalSolveConfig {
    pub fn new(target_balance: Money) -> Self {
        Self {
            target_balance,
            search_min: Decimal::ZERO,
            search_max: None,
            tolerance: DEFAULT_CONTRIBUTION_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSolveResult {
    pub target_balance: Money,
    pub contribution_frequency: ContributionFrequency,
    pub search_min: Money,
    pub search_max: Money,
    pub solved_contribution: Option<Money>,
    pub achieved_balance: Option<Money>,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Smallest contribution per installment (at the scenario's frequency) that
/// lifts the deterministic final balance to `target_balance`.
pub fn solve_required_contribution(
    scenario: &ScenarioInput,
    config: GoalSolveConfig,
) -> Result<GoalSolveResult> {
    let search_max = config.search_max.unwrap_or(config.target_balance);
    let mut errors = match scenario.validate() {
        Ok(()) => ValidationErrors::new(),
        Err(errors) => errors,
    };
    if config.target_balance <= Decimal::ZERO {
        errors.push("target_balance", "must be > 0");
    }
    if config.search_min < Decimal::ZERO {
        errors.push("search_min", "must be >= 0");
    }
    if search_max <= config.search_min {
        errors.push("search_max", "must be greater than search_min");
    }
    if config.tolerance <= Decimal::ZERO {
        errors.push("tolerance", "must be > 0");
    }
    if config.max_iterations == 0 {
        errors.push("max_iterations", "must be > 0");
    }
    errors.into_result(())?;

    let final_balance_at = |contribution: Money| -> Result<Money> {
        let candidate = ScenarioInput {
            contribution_amount: contribution,
            ..scenario.clone()
        };
        Ok(project(&candidate, false)?.summary.final_balance)
    };

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let mut solved_value = None;
    let mut converged = false;
    let feasible;
    let message;

    let low_balance = final_balance_at(config.search_min)?;
    let high_balance = final_balance_at(search_max)?;
    if low_balance >= config.target_balance {
        solved_value = Some(config.search_min);
        converged = true;
        feasible = true;
        message = "Already meets target at lower contribution bound.".to_string();
    } else if high_balance < config.target_balance {
        feasible = false;
        message = "No feasible contribution found within the search bounds.".to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = round_cents((lo + hi) / Decimal::TWO);
            let balance = final_balance_at(mid)?;
            iterations.push(SolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_value: mid,
                achieved: balance,
            });

            if balance >= config.target_balance {
                hi = mid;
            } else {
                lo = mid;
            }

            if hi - lo <= config.tolerance.max(dec!(0.01)) {
                converged = true;
                break;
            }
        }
        solved_value = Some(hi);
        feasible = true;
        message = if converged {
            "Solved required contribution.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let achieved_balance = match solved_value {
        Some(value) => Some(final_balance_at(value)?),
        None => None,
    };
    if !converged {
        warn!(target = %config.target_balance, feasible, "goal solver did not converge");
    }

    Ok(GoalSolveResult {
        target_balance: config.target_balance,
        contribution_frequency: scenario.contribution_frequency,
        search_min: config.search_min,
        search_max,
        solved_contribution: solved_value,
        achieved_balance,
        iterations,
        converged,
        feasible,
        message,
    })
}

fn validate_optimizer_config(config: OptimizerConfig, errors: &mut ValidationErrors) {
    if config.tolerance <= Decimal::ZERO {
        errors.push("tolerance", "must be > 0");
    }
    if config.max_iterations == 0 {
        errors.push("max_iterations", "must be > 0");
    }
}
