//! Risk-level allocation lookup with an age/horizon glide path.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::money::to_f64;
use crate::error::{EngineError, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskLevel {
    Conservative,
    #[serde(alias = "moderatelyConservative", alias = "moderately_conservative")]
    ModeratelyConservative,
    Moderate,
    #[serde(alias = "moderatelyAggressive", alias = "moderately_aggressive")]
    ModeratelyAggressive,
    Aggressive,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetClass {
    Stocks,
    Bonds,
    Cash,
    #[serde(alias = "realEstate", alias = "real_estate")]
    RealEstate,
    Alternatives,
}

pub const ASSET_CLASSES: [AssetClass; 5] = [
    AssetClass::Stocks,
    AssetClass::Bonds,
    AssetClass::Cash,
    AssetClass::RealEstate,
    AssetClass::Alternatives,
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetClassAssumptions {
    pub expected_return: f64,
    pub volatility: f64,
    pub best_year: f64,
    pub worst_year: f64,
}

/// Percentages per asset class; a valid model sums to exactly 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationWeights {
    pub stocks: Decimal,
    pub bonds: Decimal,
    pub cash: Decimal,
    pub real_estate: Decimal,
    pub alternatives: Decimal,
}

impl AllocationWeights {
    pub fn get(&self, class: AssetClass) -> Decimal {
        match class {
            AssetClass::Stocks => self.stocks,
            AssetClass::Bonds => self.bonds,
            AssetClass::Cash => self.cash,
            AssetClass::RealEstate => self.real_estate,
            AssetClass::Alternatives => self.alternatives,
        }
    }

    pub fn total(&self) -> Decimal {
        ASSET_CLASSES.iter().map(|&class| self.get(class)).sum()
    }

    fn fraction(&self, class: AssetClass) -> f64 {
        to_f64(self.get(class) / Decimal::ONE_HUNDRED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlidePath {
    /// Equity is capped at `age_anchor - age` percent.
    pub age_anchor: u32,
    pub min_equity: Decimal,
    pub max_equity: Decimal,
    /// Horizons shorter than this move equity into cash.
    pub short_horizon_years: u32,
    pub cash_shift_per_year: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationTables {
    pub models: BTreeMap<RiskLevel, AllocationWeights>,
    pub assumptions: BTreeMap<AssetClass, AssetClassAssumptions>,
    /// Correlation matrix in `ASSET_CLASSES` order.
    #[serde(default)]
    pub correlations: Option<Vec<Vec<f64>>>,
    pub glide_path: GlidePath,
}

impl Default for AllocationTables {
    fn default() -> Self {
        let models = BTreeMap::from([
            (RiskLevel::Conservative, weights(dec!(20), dec!(50), dec!(20), dec!(5), dec!(5))),
            (
                RiskLevel::ModeratelyConservative,
                weights(dec!(35), dec!(45), dec!(10), dec!(5), dec!(5)),
            ),
            (RiskLevel::Moderate, weights(dec!(50), dec!(30), dec!(5), dec!(10), dec!(5))),
            (
                RiskLevel::ModeratelyAggressive,
                weights(dec!(65), dec!(20), dec!(5), dec!(5), dec!(5)),
            ),
            (RiskLevel::Aggressive, weights(dec!(80), dec!(10), dec!(0), dec!(5), dec!(5))),
        ]);
        let assumptions = BTreeMap::from([
            (AssetClass::Stocks, assumption(0.10, 0.16, 0.54, -0.43)),
            (AssetClass::Bonds, assumption(0.05, 0.06, 0.33, -0.13)),
            (AssetClass::Cash, assumption(0.03, 0.01, 0.15, 0.0)),
            (AssetClass::RealEstate, assumption(0.08, 0.18, 0.47, -0.38)),
            (AssetClass::Alternatives, assumption(0.07, 0.12, 0.30, -0.25)),
        ]);
        let correlations = vec![
            vec![1.0, 0.1, 0.0, 0.6, 0.5],
            vec![0.1, 1.0, 0.2, 0.2, 0.1],
            vec![0.0, 0.2, 1.0, 0.0, 0.0],
            vec![0.6, 0.2, 0.0, 1.0, 0.4],
            vec![0.5, 0.1, 0.0, 0.4, 1.0],
        ];

        Self {
            models,
            assumptions,
            correlations: Some(correlations),
            glide_path: GlidePath {
                age_anchor: 120,
                min_equity: dec!(20),
                max_equity: dec!(95),
                short_horizon_years: 5,
                cash_shift_per_year: dec!(5),
            },
        }
    }
}

impl AllocationTables {
    pub fn validate(&self) -> Result<()> {
        for (level, model) in &self.models {
            if ASSET_CLASSES.iter().any(|&c| model.get(c) < Decimal::ZERO) {
                return Err(table_error(format!("{level:?} has a negative weight")));
            }
            if model.total() != Decimal::ONE_HUNDRED {
                return Err(table_error(format!(
                    "{level:?} weights sum to {} instead of 100",
                    model.total()
                )));
            }
        }
        for level in [
            RiskLevel::Conservative,
            RiskLevel::ModeratelyConservative,
            RiskLevel::Moderate,
            RiskLevel::ModeratelyAggressive,
            RiskLevel::Aggressive,
        ] {
            if !self.models.contains_key(&level) {
                return Err(table_error(format!("missing model for {level:?}")));
            }
        }
        for class in ASSET_CLASSES {
            let Some(a) = self.assumptions.get(&class) else {
                return Err(table_error(format!("missing assumptions for {class:?}")));
            };
            if !a.expected_return.is_finite() || !a.volatility.is_finite() || a.volatility < 0.0 {
                return Err(table_error(format!("bad assumptions for {class:?}")));
            }
        }
        if let Some(matrix) = &self.correlations {
            validate_correlations(matrix)?;
        }
        let glide = &self.glide_path;
        if glide.min_equity < Decimal::ZERO
            || glide.max_equity > Decimal::ONE_HUNDRED
            || glide.min_equity > glide.max_equity
        {
            return Err(table_error("glide path equity bounds must satisfy 0 <= min <= max <= 100".to_string()));
        }
        Ok(())
    }

    fn assumption(&self, class: AssetClass) -> AssetClassAssumptions {
        self.assumptions
            .get(&class)
            .copied()
            .unwrap_or(assumption(0.0, 0.0, 0.0, 0.0))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolatilityMethod {
    /// `sqrt(wᵀΣw)` from the correlation table.
    Covariance,
    /// Weighted average of class volatilities; overstates risk because it
    /// ignores diversification.
    WeightedAverageApproximation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAllocation {
    pub asset_class: AssetClass,
    pub percentage: Decimal,
    pub expected_return: f64,
    pub volatility: f64,
    pub best_year: f64,
    pub worst_year: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub risk_level: RiskLevel,
    pub age: Option<u32>,
    pub time_horizon_years: Option<u32>,
    pub allocation: Vec<AssetAllocation>,
    pub expected_return: f64,
    pub volatility: f64,
    pub volatility_method: VolatilityMethod,
    pub glide_path_applied: bool,
}

pub fn allocate(
    risk_level: RiskLevel,
    age: Option<u32>,
    time_horizon_years: Option<u32>,
    tables: &AllocationTables,
) -> Result<AllocationResult> {
    let Some(model) = tables.models.get(&risk_level) else {
        return Err(table_error(format!("missing model for {risk_level:?}")));
    };
    let mut weights = *model;
    let mut glide_path_applied = false;

    if let Some(age) = age {
        let glide = &tables.glide_path;
        let cap = Decimal::from(glide.age_anchor.saturating_sub(age))
            .clamp(glide.min_equity, glide.max_equity);
        if weights.stocks > cap {
            let excess = weights.stocks - cap;
            weights.stocks = cap;
            weights.bonds += excess;
            glide_path_applied = true;
        }
    }

    if let Some(horizon) = time_horizon_years {
        let glide = &tables.glide_path;
        if horizon < glide.short_horizon_years {
            let wanted = glide.cash_shift_per_year * Decimal::from(glide.short_horizon_years - horizon);
            let shift = wanted.min(weights.stocks);
            if shift > Decimal::ZERO {
                weights.stocks -= shift;
                weights.cash += shift;
                glide_path_applied = true;
            }
        }
    }

    let allocation: Vec<AssetAllocation> = ASSET_CLASSES
        .iter()
        .map(|&class| {
            let a = tables.assumption(class);
            AssetAllocation {
                asset_class: class,
                percentage: weights.get(class),
                expected_return: a.expected_return,
                volatility: a.volatility,
                best_year: a.best_year,
                worst_year: a.worst_year,
            }
        })
        .collect();

    let expected_return = ASSET_CLASSES
        .iter()
        .map(|&class| weights.fraction(class) * tables.assumption(class).expected_return)
        .sum();
    let (volatility, volatility_method) = match &tables.correlations {
        Some(matrix) => (
            covariance_volatility(&weights, tables, matrix),
            VolatilityMethod::Covariance,
        ),
        None => (
            ASSET_CLASSES
                .iter()
                .map(|&class| weights.fraction(class) * tables.assumption(class).volatility)
                .sum(),
            VolatilityMethod::WeightedAverageApproximation,
        ),
    };

    Ok(AllocationResult {
        risk_level,
        age,
        time_horizon_years,
        allocation,
        expected_return,
        volatility,
        volatility_method,
        glide_path_applied,
    })
}

fn covariance_volatility(
    weights: &AllocationWeights,
    tables: &AllocationTables,
    correlations: &[Vec<f64>],
) -> f64 {
    let scaled: Vec<f64> = ASSET_CLASSES
        .iter()
        .map(|&class| weights.fraction(class) * tables.assumption(class).volatility)
        .collect();
    let mut variance = 0.0;
    for (i, row) in correlations.iter().enumerate() {
        for (j, rho) in row.iter().enumerate() {
            variance += scaled[i] * scaled[j] * rho;
        }
    }
    variance.max(0.0).sqrt()
}

fn validate_correlations(matrix: &[Vec<f64>]) -> Result<()> {
    let n = ASSET_CLASSES.len();
    if matrix.len() != n || matrix.iter().any(|row| row.len() != n) {
        return Err(table_error(format!("correlation matrix must be {n}x{n}")));
    }
    for i in 0..n {
        if (matrix[i][i] - 1.0).abs() > 1e-9 {
            return Err(table_error("correlation diagonal must be 1".to_string()));
        }
        for j in 0..n {
            let rho = matrix[i][j];
            if !(-1.0..=1.0).contains(&rho) || (rho - matrix[j][i]).abs() > 1e-9 {
                return Err(table_error(
                    "correlations must be symmetric and within [-1, 1]".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn table_error(reason: String) -> EngineError {
    EngineError::Table {
        table: "allocation",
        reason,
    }
}

fn weights(
    stocks: Decimal,
    bonds: Decimal,
    cash: Decimal,
    real_estate: Decimal,
    alternatives: Decimal,
) -> AllocationWeights {
    AllocationWeights {
        stocks,
        bonds,
        cash,
        real_estate,
        alternatives,
    }
}

fn assumption(
    expected_return: f64,
    volatility: f64,
    best_year: f64,
    worst_year: f64,
) -> AssetClassAssumptions {
    AssetClassAssumptions {
        expected_return,
        volatility,
        best_year,
        worst_year,
    }
}
