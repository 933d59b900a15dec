mod allocation;
mod compounding;
mod money;
mod monte_carlo;
mod projector;
mod solver;
mod strategy;
mod tax_tables;
mod types;
mod withholding;

pub use allocation::{
    AllocationResult, AllocationTables, AllocationWeights, AssetAllocation, AssetClass,
    AssetClassAssumptions, GlidePath, RiskLevel, VolatilityMethod, allocate,
};
pub use compounding::{PeriodLength, PeriodRates, PeriodStep, compound_period};
pub use money::{MAX_BALANCE, Money, from_f64, percentage_difference, round_cents, to_f64};
pub use monte_carlo::{
    DEFAULT_SIMULATION_RUNS, PERCENTILE_LADDER, PercentileTrajectory, ReturnSampler,
    SeededNormalSampler, SimulationOptions, SimulationResult, simulate, simulate_with_sampler,
};
pub use projector::{cagr, project};
pub use solver::{
    GoalSolveConfig, GoalSolveResult, OptimizerConfig, SolveIteration, WithholdingOptimization,
    optimize_withholding, solve_required_contribution,
};
pub use strategy::{
    StrategyDelta, StrategyKind, StrategyOutcome, StrategyResult, compare_strategies,
};
pub use tax_tables::{
    FederalSchedule, FicaTable, FilingStatus, StateTax, TaxBracket, TaxTables, progressive_tax,
};
pub use types::{
    ContributionFrequency, MAX_RETURN_RATE, MIN_RETURN_RATE, PeriodProjection, ProjectionResult,
    ProjectionSummary, ScenarioInput,
};
pub use withholding::{
    ContributionAmount, ElectionOutcome, PayFrequency, PaycheckEstimate, RetirementComparison,
    RetirementElection, RetirementOptionOutcome, TaxTreatment, WithholdingInput,
    compare_retirement_options, estimate_withholding,
};
