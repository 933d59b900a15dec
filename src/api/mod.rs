use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::{Config, LimitsConfig, Tables};
use crate::core::{
    AllocationResult, ContributionFrequency, FilingStatus, GoalSolveConfig, GoalSolveResult, Money,
    OptimizerConfig, PayFrequency, PaycheckEstimate, ProjectionResult, RetirementComparison,
    RetirementElection, RiskLevel, ScenarioInput, SimulationOptions, SimulationResult,
    StrategyResult, WithholdingInput, WithholdingOptimization, allocate,
    compare_retirement_options, compare_strategies, estimate_withholding, from_f64,
    optimize_withholding, project, simulate, solve_required_contribution,
};
use crate::error::{EngineError, ValidationErrors};

const DEFAULT_DCA_PERIODS: u32 = 12;

#[derive(Parser, Debug)]
#[command(
    name = "finproj",
    about = "Investment projection, Monte Carlo simulation and paycheck withholding estimates"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API.
    Serve {
        #[arg(long, help = "Overrides server.port from the configuration")]
        port: Option<u16>,
    },
    /// Deterministic projection of one scenario.
    Project(ScenarioCommand),
    /// Monte Carlo simulation of one scenario.
    Simulate(ScenarioCommand),
    /// Lump sum vs dollar-cost averaging vs partial.
    Strategies(RequestArgs),
    /// Model portfolio for a risk level.
    Allocate(RequestArgs),
    /// Paycheck withholding estimate.
    Withholding(RequestArgs),
    /// Additional withholding per paycheck for a target refund.
    OptimizeWithholding(RequestArgs),
    /// Compare retirement contribution options against contributing nothing.
    RetirementOptions(RequestArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RequestArgs {
    #[arg(long, help = "JSON request file; reads stdin when omitted")]
    pub input: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ScenarioCommand {
    #[command(flatten)]
    pub request: RequestArgs,
    #[command(flatten)]
    pub flags: ScenarioFlags,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliFrequency {
    Weekly,
    BiWeekly,
    Monthly,
    Quarterly,
    Annually,
    OneTime,
}

impl From<CliFrequency> for ContributionFrequency {
    fn from(value: CliFrequency) -> Self {
        match value {
            CliFrequency::Weekly => ContributionFrequency::Weekly,
            CliFrequency::BiWeekly => ContributionFrequency::BiWeekly,
            CliFrequency::Monthly => ContributionFrequency::Monthly,
            CliFrequency::Quarterly => ContributionFrequency::Quarterly,
            CliFrequency::Annually => ContributionFrequency::Annually,
            CliFrequency::OneTime => ContributionFrequency::OneTime,
        }
    }
}

/// Scenario overrides for the one-shot commands. Rates are in percent; they
/// replace the matching fields of the JSON request when both are given.
#[derive(Args, Debug, Clone, Default)]
pub struct ScenarioFlags {
    #[arg(long)]
    pub initial_amount: Option<f64>,
    #[arg(long, help = "Expected annual return in percent, e.g. 7")]
    pub annual_return: Option<f64>,
    #[arg(long, help = "Annual return volatility in percent")]
    pub volatility: Option<f64>,
    #[arg(long, help = "Annual inflation in percent")]
    pub inflation: Option<f64>,
    #[arg(long, help = "Annual fee in percent of the balance")]
    pub fee: Option<f64>,
    #[arg(long, help = "Tax on growth in percent")]
    pub tax_rate: Option<f64>,
    #[arg(long)]
    pub years: Option<u32>,
    #[arg(long)]
    pub contribution: Option<f64>,
    #[arg(long, value_enum)]
    pub frequency: Option<CliFrequency>,
    #[arg(long, help = "Yearly contribution increase in percent")]
    pub contribution_growth: Option<f64>,
    #[arg(long)]
    pub simulations: Option<u32>,
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ScenarioPayload {
    initial_amount: Option<Money>,
    annual_return_rate: Option<f64>,
    volatility: Option<f64>,
    inflation_rate: Option<f64>,
    fee_percentage: Option<f64>,
    tax_rate: Option<f64>,
    tax_deferred: Option<bool>,
    time_horizon_years: Option<u32>,
    contribution_amount: Option<Money>,
    contribution_frequency: Option<ContributionFrequency>,
    contribution_growth_rate: Option<f64>,
    contribution_months: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProjectPayload {
    #[serde(flatten)]
    scenario: ScenarioPayload,
    include_monthly: Option<bool>,
    /// Also solve for the contribution needed to reach this balance.
    target_balance: Option<Money>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    #[serde(flatten)]
    scenario: ScenarioPayload,
    simulation_runs: Option<u32>,
    seed: Option<u64>,
    goal_amounts: Option<Vec<Money>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StrategiesPayload {
    total_amount: Option<Money>,
    time_horizon_years: Option<u32>,
    risk_level: Option<RiskLevel>,
    dca_periods: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AllocatePayload {
    risk_level: Option<RiskLevel>,
    age: Option<u32>,
    time_horizon_years: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WithholdingPayload {
    annual_salary: Option<Money>,
    filing_status: Option<FilingStatus>,
    pay_frequency: Option<PayFrequency>,
    state: Option<String>,
    allowances: Option<u32>,
    #[serde(alias = "retirementContributions")]
    elections: Option<Vec<RetirementElection>>,
    catch_up_eligible: Option<bool>,
    additional_withholding: Option<Money>,
    other_income: Option<Money>,
    itemized_deductions: Option<Money>,
    tax_credits: Option<Money>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct OptimizePayload {
    #[serde(flatten)]
    withholding: WithholdingPayload,
    target_refund: Option<Money>,
    tolerance: Option<Money>,
    max_iterations: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RetirementOptionsPayload {
    #[serde(flatten)]
    withholding: WithholdingPayload,
    options: Option<Vec<RetirementElection>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    #[serde(flatten)]
    projection: ProjectionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    goal: Option<GoalSolveResult>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<ValidationErrors>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        ApiError::Engine(EngineError::Validation(errors))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Json(_) | ApiError::Engine(EngineError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Engine(EngineError::Overflow { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Engine(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let details = match &self {
            ApiError::Engine(EngineError::Validation(errors)) => Some(errors.clone()),
            _ => None,
        };
        json_response(
            status,
            ErrorResponse {
                error: match &self {
                    ApiError::Engine(EngineError::Validation(_)) => "invalid input".to_string(),
                    other => other.to_string(),
                },
                details,
            },
        )
    }
}

/// Shared, read-only state for every request.
#[derive(Clone)]
pub struct AppState {
    pub tables: Arc<Tables>,
    pub limits: LimitsConfig,
}

impl AppState {
    pub fn new(tables: Tables, limits: LimitsConfig) -> Self {
        Self {
            tables: Arc::new(tables),
            limits,
        }
    }
}

/// One-shot operations shared by the CLI and the HTTP routes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    Project,
    Simulate,
    Strategies,
    Allocate,
    Withholding,
    OptimizeWithholding,
    RetirementOptions,
}

/// Runs `operation` on a JSON request body and returns the JSON response.
/// Scenario flags, when given, override the body for project and simulate.
pub fn execute(
    operation: Operation,
    body: &str,
    flags: Option<&ScenarioFlags>,
    state: &AppState,
) -> Result<serde_json::Value, ApiError> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    let value = match operation {
        Operation::Project => {
            let mut payload: ProjectPayload = serde_json::from_str(body)?;
            if let Some(flags) = flags {
                apply_flags(&mut payload.scenario, flags)?;
            }
            serde_json::to_value(run_project(payload, state)?)?
        }
        Operation::Simulate => {
            let mut payload: SimulatePayload = serde_json::from_str(body)?;
            if let Some(flags) = flags {
                apply_flags(&mut payload.scenario, flags)?;
                payload.simulation_runs = flags.simulations.or(payload.simulation_runs);
                payload.seed = flags.seed.or(payload.seed);
            }
            serde_json::to_value(run_simulate(payload, state)?)?
        }
        Operation::Strategies => serde_json::to_value(run_strategies(parse(body)?, state)?)?,
        Operation::Allocate => serde_json::to_value(run_allocate(parse(body)?, state)?)?,
        Operation::Withholding => serde_json::to_value(run_withholding(parse(body)?, state)?)?,
        Operation::OptimizeWithholding => {
            serde_json::to_value(run_optimize(parse(body)?, state)?)?
        }
        Operation::RetirementOptions => {
            serde_json::to_value(run_retirement_options(parse(body)?, state)?)?
        }
    };
    Ok(value)
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    Ok(serde_json::from_str(body)?)
}

fn apply_flags(payload: &mut ScenarioPayload, flags: &ScenarioFlags) -> Result<(), ApiError> {
    let mut errors = ValidationErrors::new();
    let percent = |v: f64| v / 100.0;

    if let Some(v) = flags.initial_amount {
        match from_f64(v) {
            Some(amount) => payload.initial_amount = Some(amount),
            None => errors.push("initial_amount", "must be a finite number"),
        }
    }
    if let Some(v) = flags.contribution {
        match from_f64(v) {
            Some(amount) => payload.contribution_amount = Some(amount),
            None => errors.push("contribution_amount", "must be a finite number"),
        }
    }
    if let Some(v) = flags.annual_return {
        payload.annual_return_rate = Some(percent(v));
    }
    if let Some(v) = flags.volatility {
        payload.volatility = Some(percent(v));
    }
    if let Some(v) = flags.inflation {
        payload.inflation_rate = Some(percent(v));
    }
    if let Some(v) = flags.fee {
        payload.fee_percentage = Some(percent(v));
    }
    if let Some(v) = flags.tax_rate {
        payload.tax_rate = Some(percent(v));
    }
    if let Some(v) = flags.years {
        payload.time_horizon_years = Some(v);
    }
    if let Some(v) = flags.frequency {
        payload.contribution_frequency = Some(v.into());
    }
    if let Some(v) = flags.contribution_growth {
        payload.contribution_growth_rate = Some(percent(v));
    }

    Ok(errors.into_result(())?)
}

fn build_scenario(
    payload: ScenarioPayload,
    limits: &LimitsConfig,
) -> Result<ScenarioInput, ValidationErrors> {
    let mut errors = ValidationErrors::new();
    let Some(annual_return_rate) = payload.annual_return_rate else {
        errors.push("annual_return_rate", "is required");
        return Err(errors);
    };
    let time_horizon_years = payload.time_horizon_years.unwrap_or_else(|| {
        errors.push("time_horizon_years", "is required");
        0
    });
    if time_horizon_years > limits.max_horizon_years {
        errors.push(
            "time_horizon_years",
            format!("must be <= {}", limits.max_horizon_years),
        );
    }

    let scenario = ScenarioInput {
        initial_amount: payload.initial_amount.unwrap_or(Decimal::ZERO),
        annual_return_rate,
        volatility: payload.volatility,
        inflation_rate: payload.inflation_rate.unwrap_or(0.0),
        fee_percentage: payload.fee_percentage.unwrap_or(0.0),
        tax_rate: payload.tax_rate.unwrap_or(0.0),
        tax_deferred: payload.tax_deferred.unwrap_or(false),
        time_horizon_years,
        contribution_amount: payload.contribution_amount.unwrap_or(Decimal::ZERO),
        contribution_frequency: payload
            .contribution_frequency
            .unwrap_or(ContributionFrequency::Monthly),
        contribution_growth_rate: payload.contribution_growth_rate.unwrap_or(0.0),
        contribution_months: payload.contribution_months,
    };
    if let Err(more) = scenario.validate() {
        errors.extend(more);
    }
    errors.into_result(scenario)
}

fn build_withholding(payload: WithholdingPayload) -> Result<WithholdingInput, ValidationErrors> {
    let mut errors = ValidationErrors::new();
    let Some(annual_salary) = payload.annual_salary else {
        errors.push("annual_salary", "is required");
        return Err(errors);
    };
    let mut input = WithholdingInput::new(
        annual_salary,
        payload.filing_status.unwrap_or(FilingStatus::Single),
        payload.pay_frequency.unwrap_or(PayFrequency::BiWeekly),
        payload.state.unwrap_or_else(|| "TX".to_string()),
    );
    input.allowances = payload.allowances.unwrap_or(0);
    input.elections = payload.elections.unwrap_or_default();
    input.catch_up_eligible = payload.catch_up_eligible.unwrap_or(false);
    input.additional_withholding = payload.additional_withholding.unwrap_or(Decimal::ZERO);
    input.other_income = payload.other_income.unwrap_or(Decimal::ZERO);
    input.itemized_deductions = payload.itemized_deductions.unwrap_or(Decimal::ZERO);
    input.tax_credits = payload.tax_credits.unwrap_or(Decimal::ZERO);
    Ok(input)
}

fn run_project(payload: ProjectPayload, state: &AppState) -> Result<ProjectResponse, ApiError> {
    let scenario = build_scenario(payload.scenario, &state.limits)?;
    let projection = project(&scenario, payload.include_monthly.unwrap_or(false))?;
    let goal = match payload.target_balance {
        Some(target) => Some(solve_required_contribution(
            &scenario,
            GoalSolveConfig::new(target),
        )?),
        None => None,
    };
    Ok(ProjectResponse { projection, goal })
}

fn run_simulate(payload: SimulatePayload, state: &AppState) -> Result<SimulationResult, ApiError> {
    let mut errors = ValidationErrors::new();
    let scenario = match build_scenario(payload.scenario, &state.limits) {
        Ok(scenario) => Some(scenario),
        Err(more) => {
            errors.extend(more);
            None
        }
    };
    let runs = payload
        .simulation_runs
        .unwrap_or(state.limits.default_simulation_runs);
    if runs > state.limits.max_simulation_runs {
        errors.push(
            "simulation_runs",
            format!("must be <= {}", state.limits.max_simulation_runs),
        );
    }
    let scenario = errors.into_result(scenario)?;
    let Some(scenario) = scenario else {
        return Err(ApiError::Internal("scenario missing after validation".into()));
    };

    let options = SimulationOptions {
        seed: payload.seed,
        goal_amounts: payload.goal_amounts.unwrap_or_default(),
    };
    Ok(simulate(&scenario, runs, &options)?)
}

fn run_strategies(payload: StrategiesPayload, state: &AppState) -> Result<StrategyResult, ApiError> {
    let mut errors = ValidationErrors::new();
    if payload.total_amount.is_none() {
        errors.push("total_amount", "is required");
    }
    if payload.time_horizon_years.is_none() {
        errors.push("time_horizon_years", "is required");
    }
    let years = payload.time_horizon_years.unwrap_or(0);
    if years > state.limits.max_horizon_years {
        errors.push(
            "time_horizon_years",
            format!("must be <= {}", state.limits.max_horizon_years),
        );
    }
    errors.into_result(())?;

    Ok(compare_strategies(
        payload.total_amount.unwrap_or(Decimal::ZERO),
        years,
        payload.risk_level.unwrap_or(RiskLevel::Moderate),
        payload.dca_periods.unwrap_or(DEFAULT_DCA_PERIODS),
        &state.tables.allocation,
    )?)
}

fn run_allocate(payload: AllocatePayload, state: &AppState) -> Result<AllocationResult, ApiError> {
    let Some(risk_level) = payload.risk_level else {
        return Err(ValidationErrors::single("risk_level", "is required").into());
    };
    Ok(allocate(
        risk_level,
        payload.age,
        payload.time_horizon_years,
        &state.tables.allocation,
    )?)
}

fn run_withholding(
    payload: WithholdingPayload,
    state: &AppState,
) -> Result<PaycheckEstimate, ApiError> {
    let input = build_withholding(payload)?;
    Ok(estimate_withholding(&input, &state.tables.tax)?)
}

fn run_optimize(
    payload: OptimizePayload,
    state: &AppState,
) -> Result<WithholdingOptimization, ApiError> {
    let Some(target_refund) = payload.target_refund else {
        return Err(ValidationErrors::single("target_refund", "is required").into());
    };
    let input = build_withholding(payload.withholding)?;
    let defaults = OptimizerConfig::default();
    let config = OptimizerConfig {
        tolerance: payload.tolerance.unwrap_or(defaults.tolerance),
        max_iterations: payload.max_iterations.unwrap_or(defaults.max_iterations),
    };
    Ok(optimize_withholding(&input, target_refund, &state.tables.tax, config)?)
}

fn run_retirement_options(
    payload: RetirementOptionsPayload,
    state: &AppState,
) -> Result<RetirementComparison, ApiError> {
    let options = payload.options.unwrap_or_default();
    let input = build_withholding(payload.withholding)?;
    Ok(compare_retirement_options(&input, &options, &state.tables.tax)?)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/project", post(project_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/strategies", post(strategies_handler))
        .route(
            "/api/allocate",
            get(allocate_get_handler).post(allocate_post_handler),
        )
        .route("/api/withholding", post(withholding_handler))
        .route("/api/withholding/optimize", post(optimize_handler))
        .route("/api/retirement-options", post(retirement_options_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(config: &Config, tables: Tables) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let app = router(AppState::new(tables, config.limits));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "finproj HTTP API listening");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    json_response(
        StatusCode::NOT_FOUND,
        ErrorResponse {
            error: "Not found".to_string(),
            details: None,
        },
    )
}

async fn project_handler(
    State(state): State<AppState>,
    Json(payload): Json<ProjectPayload>,
) -> Response {
    info!(route = "project", "request");
    respond(run_project(payload, &state))
}

async fn simulate_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    info!(route = "simulate", runs = ?payload.simulation_runs, "request");
    let result = tokio::task::spawn_blocking(move || run_simulate(payload, &state))
        .await
        .unwrap_or_else(|e| Err(ApiError::Internal(e.to_string())));
    respond(result)
}

async fn strategies_handler(
    State(state): State<AppState>,
    Json(payload): Json<StrategiesPayload>,
) -> Response {
    info!(route = "strategies", "request");
    respond(run_strategies(payload, &state))
}

async fn allocate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<AllocatePayload>,
) -> Response {
    info!(route = "allocate", "request");
    respond(run_allocate(payload, &state))
}

async fn allocate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<AllocatePayload>,
) -> Response {
    info!(route = "allocate", "request");
    respond(run_allocate(payload, &state))
}

async fn withholding_handler(
    State(state): State<AppState>,
    Json(payload): Json<WithholdingPayload>,
) -> Response {
    info!(route = "withholding", "request");
    respond(run_withholding(payload, &state))
}

async fn optimize_handler(
    State(state): State<AppState>,
    Json(payload): Json<OptimizePayload>,
) -> Response {
    info!(route = "withholding/optimize", "request");
    respond(run_optimize(payload, &state))
}

async fn retirement_options_handler(
    State(state): State<AppState>,
    Json(payload): Json<RetirementOptionsPayload>,
) -> Response {
    info!(route = "retirement-options", "request");
    respond(run_retirement_options(payload, &state))
}

fn respond<T: Serialize>(result: Result<T, ApiError>) -> Response {
    match result {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => e.into_response(),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}
