use std::collections::BTreeMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use super::money::{Money, rate, round_cents};
use super::projector::{run_path, summarize};
use super::types::{MAX_RETURN_RATE, MIN_RETURN_RATE, ScenarioInput};
use crate::error::{EngineError, Result, ValidationErrors};

pub const DEFAULT_SIMULATION_RUNS: u32 = 1_000;
pub const PERCENTILE_LADDER: [u8; 5] = [10, 25, 50, 75, 90];

/// Source of annual return paths. Each run must be reproducible from its
/// index alone so runs can execute in any order on any thread.
pub trait ReturnSampler: Sync {
    fn annual_returns(&self, run: u32, years: u32, mean: f64, volatility: f64) -> Result<Vec<f64>>;
}

/// Normal annual returns from a ChaCha stream seeded per run.
#[derive(Debug, Clone, Copy)]
pub struct SeededNormalSampler {
    seed: u64,
}

impl SeededNormalSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl ReturnSampler for SeededNormalSampler {
    fn annual_returns(&self, run: u32, years: u32, mean: f64, volatility: f64) -> Result<Vec<f64>> {
        let normal =
            Normal::new(mean, volatility).map_err(|e| EngineError::Sampling(e.to_string()))?;
        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(self.seed, run));
        Ok((0..years)
            .map(|_| normal.sample(&mut rng).clamp(MIN_RETURN_RATE, MAX_RETURN_RATE))
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    /// Fixed seed for reproducible output; a fresh one is drawn when absent.
    pub seed: Option<u64>,
    /// Each goal adds a `reach_<amount>` probability.
    pub goal_amounts: Vec<Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileTrajectory {
    pub percentile: u8,
    pub final_balance: Money,
    /// Balance at the end of each year, starting with the opening balance.
    pub trajectory: Vec<Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub simulation_runs: u32,
    pub seed: u64,
    pub median_final_balance: Money,
    pub mean_final_balance: Money,
    pub best_case: Money,
    pub worst_case: Money,
    pub total_contributions: Money,
    pub percentiles: Vec<PercentileTrajectory>,
    pub probabilities: BTreeMap<String, f64>,
}

struct RunOutcome {
    final_balance: Money,
    trajectory: Vec<Money>,
}

pub fn simulate(
    scenario: &ScenarioInput,
    simulation_runs: u32,
    options: &SimulationOptions,
) -> Result<SimulationResult> {
    let seed = options.seed.unwrap_or_else(rand::random);
    simulate_with_sampler(
        scenario,
        simulation_runs,
        &options.goal_amounts,
        &SeededNormalSampler::new(seed),
        seed,
    )
}

pub fn simulate_with_sampler<S: ReturnSampler>(
    scenario: &ScenarioInput,
    simulation_runs: u32,
    goal_amounts: &[Money],
    sampler: &S,
    seed: u64,
) -> Result<SimulationResult> {
    let mut errors = match scenario.validate() {
        Ok(()) => ValidationErrors::new(),
        Err(errors) => errors,
    };
    if simulation_runs == 0 {
        errors.push("simulation_runs", "must be > 0");
    }
    if goal_amounts.iter().any(|goal| *goal < Decimal::ZERO) {
        errors.push("goal_amounts", "must be >= 0");
    }
    errors.into_result(())?;

    let years = scenario.time_horizon_years;
    let mean = scenario.annual_return_rate;
    let volatility = scenario.volatility.unwrap_or(0.0);
    debug!(simulation_runs, years, mean, volatility, seed, "starting monte carlo");

    let runs = (0..simulation_runs)
        .into_par_iter()
        .map(|run| {
            let returns = sampler.annual_returns(run, years, mean, volatility)?;
            let rows = run_path(scenario, &returns, None)?;
            let trajectory: Vec<Money> = rows.iter().map(|row| row.closing_balance).collect();
            Ok(RunOutcome {
                final_balance: trajectory.last().copied().unwrap_or(scenario.initial_amount),
                trajectory,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Contributions do not depend on returns, so any path gives the total.
    let fixed_path = run_path(scenario, &vec![0.0; years as usize], None)?;
    let total_contributions = summarize(scenario, &fixed_path).total_contributions;

    aggregate(runs, seed, total_contributions, goal_amounts)
}

fn aggregate(
    runs: Vec<RunOutcome>,
    seed: u64,
    total_contributions: Money,
    goal_amounts: &[Money],
) -> Result<SimulationResult> {
    let mut order: Vec<usize> = (0..runs.len()).collect();
    order.sort_by(|&a, &b| {
        runs[a]
            .final_balance
            .cmp(&runs[b].final_balance)
            .then(a.cmp(&b))
    });
    let sorted_finals: Vec<Money> = order.iter().map(|&idx| runs[idx].final_balance).collect();
    let n = sorted_finals.len();

    let percentiles = PERCENTILE_LADDER
        .iter()
        .map(|&p| {
            let run = &runs[order[closest_rank(n, p as f64)]];
            PercentileTrajectory {
                percentile: p,
                final_balance: run.final_balance,
                trajectory: run.trajectory.clone(),
            }
        })
        .collect();

    let total = sorted_finals
        .iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(*value))
        .ok_or(EngineError::Overflow {
            context: "averaging run balances",
        })?;
    let mut probabilities = BTreeMap::new();
    probabilities.insert(
        "finish_above_contributions".to_string(),
        share_at_least(&sorted_finals, total_contributions),
    );
    for goal in goal_amounts {
        probabilities.insert(
            format!("reach_{}", goal.normalize()),
            share_at_least(&sorted_finals, *goal),
        );
    }

    Ok(SimulationResult {
        simulation_runs: n as u32,
        seed,
        median_final_balance: percentile(&sorted_finals, 50.0),
        mean_final_balance: round_cents(total / Decimal::from(n as u64)),
        best_case: sorted_finals[n - 1],
        worst_case: sorted_finals[0],
        total_contributions,
        percentiles,
        probabilities,
    })
}

/// Index into the sorted runs nearest to the given percentile rank.
fn closest_rank(n: usize, p: f64) -> usize {
    if n <= 1 {
        return 0;
    }
    let rank = (p / 100.0) * (n as f64 - 1.0);
    (rank.round() as usize).min(n - 1)
}

fn share_at_least(sorted: &[Money], threshold: Money) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let below = sorted.partition_point(|value| *value < threshold);
    (sorted.len() - below) as f64 / sorted.len() as f64
}

fn percentile(sorted: &[Money], p: f64) -> Money {
    if sorted.is_empty() {
        return Decimal::ZERO;
    }

    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper || sorted[lower] == sorted[upper] {
        sorted[lower]
    } else {
        let w = rate(rank - lower as f64);
        round_cents(sorted[lower] * (Decimal::ONE - w) + sorted[upper] * w)
    }
}

fn derive_seed(base_seed: u64, run: u32) -> u64 {
    splitmix64(base_seed ^ ((run as u64) << 17) ^ run as u64)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::to_f64;
    use crate::core::projector::project;
    use crate::core::types::ContributionFrequency;
    use rust_decimal_macros::dec;

    fn volatile_scenario() -> ScenarioInput {
        ScenarioInput {
            volatility: Some(0.15),
            contribution_amount: dec!(200),
            contribution_frequency: ContributionFrequency::Monthly,
            fee_percentage: 0.005,
            ..ScenarioInput::lump_sum(dec!(25000), 0.07, 15)
        }
    }

    struct ConstantSampler(f64);

    impl ReturnSampler for ConstantSampler {
        fn annual_returns(&self, _run: u32, years: u32, _mean: f64, _vol: f64) -> Result<Vec<f64>> {
            Ok(vec![self.0; years as usize])
        }
    }

    /// Run `i` earns `i%` every year.
    struct LadderSampler;

    impl ReturnSampler for LadderSampler {
        fn annual_returns(&self, run: u32, years: u32, _mean: f64, _vol: f64) -> Result<Vec<f64>> {
            Ok(vec![run as f64 / 100.0; years as usize])
        }
    }

    #[test]
    fn zero_volatility_collapses_to_deterministic_projection() {
        let scenario = ScenarioInput {
            volatility: Some(0.0),
            ..volatile_scenario()
        };
        let deterministic = project(&scenario, false).expect("valid scenario");
        let options = SimulationOptions {
            seed: Some(9),
            goal_amounts: Vec::new(),
        };
        let result = simulate(&scenario, 200, &options).expect("valid simulation");

        let expected = deterministic.summary.final_balance;
        assert_eq!(result.best_case, expected);
        assert_eq!(result.worst_case, expected);
        assert_eq!(result.median_final_balance, expected);
        for ladder in &result.percentiles {
            assert_eq!(ladder.final_balance, expected);
        }
    }

    #[test]
    fn fixed_seed_reruns_are_identical() {
        let options = SimulationOptions {
            seed: Some(1234),
            goal_amounts: vec![dec!(100000)],
        };
        let a = simulate(&volatile_scenario(), 300, &options).expect("valid simulation");
        let b = simulate(&volatile_scenario(), 300, &options).expect("valid simulation");
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_produce_different_distributions() {
        let a = simulate(
            &volatile_scenario(),
            200,
            &SimulationOptions {
                seed: Some(1),
                ..SimulationOptions::default()
            },
        )
        .expect("valid simulation");
        let b = simulate(
            &volatile_scenario(),
            200,
            &SimulationOptions {
                seed: Some(2),
                ..SimulationOptions::default()
            },
        )
        .expect("valid simulation");
        assert_ne!(a.best_case, b.best_case);
    }

    #[test]
    fn percentile_ladder_is_ordered_and_uses_real_runs() {
        let result = simulate(
            &volatile_scenario(),
            500,
            &SimulationOptions {
                seed: Some(77),
                ..SimulationOptions::default()
            },
        )
        .expect("valid simulation");

        assert_eq!(result.percentiles.len(), PERCENTILE_LADDER.len());
        for pair in result.percentiles.windows(2) {
            assert!(pair[0].final_balance <= pair[1].final_balance);
        }
        for ladder in &result.percentiles {
            assert_eq!(ladder.trajectory.len(), 16);
            assert_eq!(ladder.trajectory[0], dec!(25000));
            assert_eq!(ladder.trajectory.last().copied(), Some(ladder.final_balance));
        }
        assert!(result.worst_case <= result.median_final_balance);
        assert!(result.median_final_balance <= result.best_case);
    }

    #[test]
    fn ladder_sampler_picks_expected_runs() {
        let scenario = ScenarioInput::lump_sum(dec!(1000), 0.0, 1);
        let goals = [dec!(1045)];
        let result =
            simulate_with_sampler(&scenario, 101, &goals, &LadderSampler, 0).expect("valid");

        let near = |actual: Money, expected: f64| (to_f64(actual) - expected).abs() <= 0.1;
        assert_eq!(result.worst_case, dec!(1000));
        assert!(near(result.best_case, 2000.0));
        let p90 = &result.percentiles[4];
        assert_eq!(p90.percentile, 90);
        assert!(near(p90.final_balance, 1900.0));
        assert!(near(result.median_final_balance, 1500.0));
        // Runs 5..=100 finish above 1045.
        assert_eq!(result.probabilities["reach_1045"], 96.0 / 101.0);
        assert_eq!(result.probabilities["finish_above_contributions"], 1.0);
    }

    #[test]
    fn runaway_returns_fail_instead_of_panicking() {
        let scenario = ScenarioInput::lump_sum(dec!(10000), 0.07, 40);
        let err = simulate_with_sampler(&scenario, 8, &[], &ConstantSampler(5.0), 0)
            .expect_err("balances cannot fit");
        assert!(matches!(err, EngineError::Overflow { .. }), "{err}");
    }

    #[test]
    fn constant_sampler_matches_projection_trajectory() {
        let scenario = volatile_scenario();
        let result =
            simulate_with_sampler(&scenario, 3, &[], &ConstantSampler(0.07), 0).expect("valid");
        let projection = project(&scenario, false).expect("valid scenario");
        let expected: Vec<Money> = projection
            .annual_projection
            .iter()
            .map(|row| row.closing_balance)
            .collect();
        assert_eq!(result.percentiles[2].trajectory, expected);
        assert_eq!(result.total_contributions, projection.summary.total_contributions);
    }

    #[test]
    fn zero_runs_is_a_validation_error() {
        let err = simulate(&volatile_scenario(), 0, &SimulationOptions::default())
            .expect_err("must reject zero runs");
        match err {
            EngineError::Validation(errors) => assert!(errors.contains_field("simulation_runs")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn negative_volatility_is_a_validation_error() {
        let scenario = ScenarioInput {
            volatility: Some(-0.01),
            ..volatile_scenario()
        };
        let err = simulate(&scenario, 10, &SimulationOptions::default())
            .expect_err("must reject negative volatility");
        assert!(err.to_string().contains("volatility"));
    }

    #[test]
    fn percentile_interpolates_between_neighbours() {
        let values = [dec!(10), dec!(20), dec!(30), dec!(40)];
        assert_eq!(percentile(&values, 50.0), dec!(25));
        assert_eq!(percentile(&values, 0.0), dec!(10));
        assert_eq!(percentile(&values, 100.0), dec!(40));
    }

    #[test]
    fn sampler_draws_are_reproducible_per_run() {
        let sampler = SeededNormalSampler::new(42);
        let a = sampler.annual_returns(3, 10, 0.07, 0.2).expect("valid");
        let b = sampler.annual_returns(3, 10, 0.07, 0.2).expect("valid");
        let c = sampler.annual_returns(4, 10, 0.07, 0.2).expect("valid");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|r| (MIN_RETURN_RATE..=MAX_RETURN_RATE).contains(r)));
    }
}
