use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, ValueEnum};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{
    DEFAULT_HISTOGRAM_BINS, HistogramBin, HouseholdParameters, PersonProfile, RandomStreams,
    ResultsSummary, Scenario, SimulationResults, run_simulation_with,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliStreams {
    Shared,
    PerTrial,
}

impl From<CliStreams> for RandomStreams {
    fn from(value: CliStreams) -> Self {
        match value {
            CliStreams::Shared => RandomStreams::Shared,
            CliStreams::PerTrial => RandomStreams::PerTrial,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
enum ApiStreams {
    Shared,
    #[serde(alias = "perTrial", alias = "per_trial", alias = "parallel")]
    PerTrial,
}

impl From<ApiStreams> for RandomStreams {
    fn from(value: ApiStreams) -> Self {
        match value {
            ApiStreams::Shared => RandomStreams::Shared,
            ApiStreams::PerTrial => RandomStreams::PerTrial,
        }
    }
}

impl From<RandomStreams> for ApiStreams {
    fn from(value: RandomStreams) -> Self {
        match value {
            RandomStreams::Shared => ApiStreams::Shared,
            RandomStreams::PerTrial => ApiStreams::PerTrial,
        }
    }
}

/// Flat overrides applied on top of the default scenario. Rates and weights
/// are decimal fractions, matching the scenario JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    scenario_name: Option<String>,
    portfolio: Option<f64>,
    annual_spending: Option<f64>,
    annual_contribution: Option<f64>,
    stock_real_mean: Option<f64>,
    stock_vol: Option<f64>,
    bond_real_mean: Option<f64>,
    bond_vol: Option<f64>,
    stock_bond_corr: Option<f64>,
    stock_weight: Option<f64>,
    years: Option<f64>,
    runs: Option<f64>,
    seed: Option<f64>,
    person_a_name: Option<String>,
    person_a_current_age: Option<u32>,
    person_a_retire_age: Option<u32>,
    person_a_benefit_start_age: Option<u32>,
    person_a_annual_benefit: Option<f64>,
    person_b_name: Option<String>,
    person_b_current_age: Option<u32>,
    person_b_retire_age: Option<u32>,
    person_b_benefit_start_age: Option<u32>,
    person_b_annual_benefit: Option<f64>,
    streams: Option<ApiStreams>,
    histogram_bins: Option<usize>,
}

#[derive(Parser, Debug)]
#[command(
    name = "retire-mc",
    about = "Monte Carlo survival estimate for a two-person household retirement portfolio"
)]
struct Cli {
    #[arg(long, default_value = "Base case")]
    scenario_name: String,
    #[arg(long, default_value_t = 800_000.0, help = "Starting portfolio balance")]
    portfolio: f64,
    #[arg(long, default_value_t = 65_000.0, help = "Annual spending in today's money")]
    annual_spending: f64,
    #[arg(
        long,
        default_value_t = 24_000.0,
        help = "Annual contribution while either person works"
    )]
    annual_contribution: f64,
    #[arg(long, default_value_t = 5.5, help = "Expected real stock return in percent")]
    stock_real_mean: f64,
    #[arg(long, default_value_t = 17.0, help = "Stock return volatility in percent")]
    stock_vol: f64,
    #[arg(long, default_value_t = 2.0, help = "Expected real bond return in percent")]
    bond_real_mean: f64,
    #[arg(long, default_value_t = 6.0, help = "Bond return volatility in percent")]
    bond_vol: f64,
    #[arg(
        long,
        default_value_t = 0.15,
        allow_negative_numbers = true,
        help = "Stock/bond return correlation as a fraction in [-1, 1], not a percent"
    )]
    stock_bond_corr: f64,
    #[arg(long, default_value_t = 70.0, help = "Stock allocation in percent")]
    stock_weight: f64,
    #[arg(long, default_value_t = 45)]
    years: u32,
    #[arg(long, default_value_t = 5_000, help = "Number of trials (minimum 100)")]
    runs: u32,
    #[arg(long, default_value_t = 42)]
    seed: u32,
    #[arg(long, default_value = "You")]
    person_a_name: String,
    #[arg(long, default_value_t = 40)]
    person_a_current_age: u32,
    #[arg(long, default_value_t = 55)]
    person_a_retire_age: u32,
    #[arg(long, default_value_t = 67)]
    person_a_benefit_start_age: u32,
    #[arg(long, default_value_t = 28_000.0)]
    person_a_annual_benefit: f64,
    #[arg(long, default_value = "Partner")]
    person_b_name: String,
    #[arg(long, default_value_t = 38)]
    person_b_current_age: u32,
    #[arg(long, default_value_t = 55)]
    person_b_retire_age: u32,
    #[arg(long, default_value_t = 67)]
    person_b_benefit_start_age: u32,
    #[arg(long, default_value_t = 22_000.0)]
    person_b_annual_benefit: f64,
    #[arg(long, value_enum, default_value_t = CliStreams::Shared)]
    streams: CliStreams,
    #[arg(long, default_value_t = DEFAULT_HISTOGRAM_BINS)]
    histogram_bins: usize,
    #[arg(long, help = "Print the full results as JSON")]
    json: bool,
}

#[derive(Copy, Clone, Debug)]
struct ApiOptions {
    streams: RandomStreams,
    histogram_bins: usize,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            streams: RandomStreams::Shared,
            histogram_bins: DEFAULT_HISTOGRAM_BINS,
        }
    }
}

#[derive(Debug)]
struct ApiRequest {
    scenario: Scenario,
    options: ApiOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    streams: ApiStreams,
    scenario: Scenario,
    results: SimulationResults,
    summary: ResultsSummary,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn build_scenario(cli: &Cli) -> Result<Scenario, String> {
    let scenario = Scenario {
        household: HouseholdParameters {
            scenario_name: cli.scenario_name.clone(),
            portfolio: cli.portfolio,
            annual_spending: cli.annual_spending,
            annual_contribution: cli.annual_contribution,
            stock_real_mean: cli.stock_real_mean / 100.0,
            stock_vol: cli.stock_vol / 100.0,
            bond_real_mean: cli.bond_real_mean / 100.0,
            bond_vol: cli.bond_vol / 100.0,
            stock_bond_corr: cli.stock_bond_corr,
            stock_weight: cli.stock_weight / 100.0,
            years: cli.years,
            runs: cli.runs,
            seed: cli.seed,
        },
        person_a: PersonProfile {
            name: cli.person_a_name.clone(),
            current_age: cli.person_a_current_age,
            retire_age: cli.person_a_retire_age,
            benefit_start_age: cli.person_a_benefit_start_age,
            annual_benefit: cli.person_a_annual_benefit,
        },
        person_b: PersonProfile {
            name: cli.person_b_name.clone(),
            current_age: cli.person_b_current_age,
            retire_age: cli.person_b_retire_age,
            benefit_start_age: cli.person_b_benefit_start_age,
            annual_benefit: cli.person_b_annual_benefit,
        },
    };

    scenario
        .validate()
        .map_err(|e| format!("invalid scenario: {e}"))?;
    Ok(scenario)
}

/// Parses command-line flags, runs one simulation and prints it.
pub fn run_cli() -> Result<(), String> {
    let cli = Cli::parse();
    let scenario = build_scenario(&cli)?;
    let streams = RandomStreams::from(cli.streams);
    let results = run_simulation_with(&scenario, streams);
    let summary = ResultsSummary::from_results(&results, cli.histogram_bins);

    if cli.json {
        let response = SimulateResponse {
            streams: streams.into(),
            scenario,
            results,
            summary,
        };
        let json = serde_json::to_string_pretty(&response)
            .map_err(|e| format!("failed to serialize results: {e}"))?;
        println!("{json}");
    } else {
        print!("{}", render_text_report(&scenario, &results, &summary));
    }
    Ok(())
}

fn render_text_report(
    scenario: &Scenario,
    results: &SimulationResults,
    summary: &ResultsSummary,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Scenario: {}\n", scenario.household.scenario_name));
    out.push_str(&format!(
        "Success rate: {:.1}% ({} of {} trials ruined)\n",
        summary.success_rate * 100.0,
        summary.failed_trials,
        summary.runs
    ));
    if let Some(year) = summary.first_failure_year {
        out.push_str(&format!("First ruin: year {year}\n"));
    }
    out.push_str(&format!(
        "Ending balance p10 / p50 / p90: {:.0} / {:.0} / {:.0}\n",
        summary.ending_p10, summary.ending_p50, summary.ending_p90
    ));
    out.push_str("\nYear          p10          p50          p90\n");
    let last = results.path_percentiles.len().saturating_sub(1);
    for (idx, point) in results.path_percentiles.iter().enumerate() {
        if idx % 5 == 0 || idx == last {
            out.push_str(&format!(
                "{:>4} {:>12.0} {:>12.0} {:>12.0}\n",
                point.year, point.p10, point.p50, point.p90
            ));
        }
    }
    out.push_str("\nEnding balance distribution\n");
    for bin in &summary.ending_histogram {
        out.push_str(&format!(
            "{:>12.0} - {:>12.0} {}\n",
            bin.lower,
            bin.upper,
            histogram_bar(bin, summary.runs)
        ));
    }
    out
}

fn histogram_bar(bin: &HistogramBin, runs: usize) -> String {
    const WIDTH: usize = 40;
    let filled = if runs == 0 {
        0
    } else {
        (bin.count as usize * WIDTH).div_ceil(runs)
    };
    format!("{} {}", "#".repeat(filled), bin.count)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/scenario/default", get(default_scenario_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/simulate/scenario", post(simulate_scenario_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!("retirement simulation API listening on http://{addr}");
    info!("local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app).await
}

async fn default_scenario_handler() -> Response {
    json_response(StatusCode::OK, Scenario::default())
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_scenario_handler(Json(scenario): Json<Scenario>) -> Response {
    if let Err(e) = scenario.validate() {
        return error_response(StatusCode::BAD_REQUEST, &format!("invalid scenario: {e}"));
    }
    run_request(ApiRequest {
        scenario,
        options: ApiOptions::default(),
    })
    .await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    match api_request_from_payload(payload) {
        Ok(request) => run_request(request).await,
        Err(msg) => {
            debug!("rejected simulate request: {msg}");
            error_response(StatusCode::BAD_REQUEST, &msg)
        }
    }
}

async fn run_request(request: ApiRequest) -> Response {
    let outcome = tokio::task::spawn_blocking(move || {
        let results = run_simulation_with(&request.scenario, request.options.streams);
        let summary = ResultsSummary::from_results(&results, request.options.histogram_bins);
        SimulateResponse {
            streams: request.options.streams.into(),
            scenario: request.scenario,
            results,
            summary,
        }
    })
    .await;

    match outcome {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(e) => {
            warn!("simulation task failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation failed")
        }
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

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut scenario = Scenario::default();
    let mut options = ApiOptions::default();
    let household = &mut scenario.household;

    if let Some(v) = payload.scenario_name {
        household.scenario_name = v;
    }
    if let Some(v) = payload.portfolio {
        household.portfolio = v;
    }
    if let Some(v) = payload.annual_spending {
        household.annual_spending = v;
    }
    if let Some(v) = payload.annual_contribution {
        household.annual_contribution = v;
    }
    if let Some(v) = payload.stock_real_mean {
        household.stock_real_mean = v;
    }
    if let Some(v) = payload.stock_vol {
        household.stock_vol = v;
    }
    if let Some(v) = payload.bond_real_mean {
        household.bond_real_mean = v;
    }
    if let Some(v) = payload.bond_vol {
        household.bond_vol = v;
    }
    if let Some(v) = payload.stock_bond_corr {
        household.stock_bond_corr = v;
    }
    if let Some(v) = payload.stock_weight {
        household.stock_weight = v;
    }
    if let Some(v) = payload.years {
        household.years = floor_count("years", v)?;
    }
    if let Some(v) = payload.runs {
        household.runs = floor_count("runs", v)?;
    }
    if let Some(v) = payload.seed {
        household.seed = floor_seed(v)?;
    }

    let person_a = &mut scenario.person_a;
    if let Some(v) = payload.person_a_name {
        person_a.name = v;
    }
    if let Some(v) = payload.person_a_current_age {
        person_a.current_age = v;
    }
    if let Some(v) = payload.person_a_retire_age {
        person_a.retire_age = v;
    }
    if let Some(v) = payload.person_a_benefit_start_age {
        person_a.benefit_start_age = v;
    }
    if let Some(v) = payload.person_a_annual_benefit {
        person_a.annual_benefit = v;
    }

    let person_b = &mut scenario.person_b;
    if let Some(v) = payload.person_b_name {
        person_b.name = v;
    }
    if let Some(v) = payload.person_b_current_age {
        person_b.current_age = v;
    }
    if let Some(v) = payload.person_b_retire_age {
        person_b.retire_age = v;
    }
    if let Some(v) = payload.person_b_benefit_start_age {
        person_b.benefit_start_age = v;
    }
    if let Some(v) = payload.person_b_annual_benefit {
        person_b.annual_benefit = v;
    }

    if let Some(v) = payload.streams {
        options.streams = v.into();
    }
    if let Some(v) = payload.histogram_bins {
        if v == 0 {
            return Err("histogramBins must be > 0".to_string());
        }
        options.histogram_bins = v;
    }

    scenario
        .validate()
        .map_err(|e| format!("invalid scenario: {e}"))?;
    Ok(ApiRequest { scenario, options })
}

/// Floors a JSON number to a non-negative count.
fn floor_count(field: &str, value: f64) -> Result<u32, String> {
    if !value.is_finite() {
        return Err(format!("{field} must be a finite number"));
    }
    let floored = value.floor();
    if floored < 0.0 {
        return Err(format!("{field} must be >= 0"));
    }
    if floored > u32::MAX as f64 {
        return Err(format!("{field} is too large"));
    }
    Ok(floored as u32)
}

/// Floors a JSON number to an integer seed, wrapping into 32 bits.
fn floor_seed(value: f64) -> Result<u32, String> {
    if !value.is_finite() {
        return Err("seed must be a finite number".to_string());
    }
    Ok(value.floor() as i64 as u32)
}
