mod engine;
mod report;
mod rng;
mod types;

pub use engine::{RandomStreams, run_simulation, run_simulation_with};
pub use report::{
    DEFAULT_HISTOGRAM_BINS, HistogramBin, ResultsSummary, ending_histogram, first_failure_year,
};
pub use rng::Rng;
pub use types::{
    HouseholdParameters, MAX_RUNS, MAX_YEARS, MIN_RUNS, MIN_YEARS, PercentilePoint, PersonProfile,
    Scenario, ScenarioError, SimulationResults,
};
