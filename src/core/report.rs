use serde::Serialize;

use super::engine::quantile;
use super::types::SimulationResults;

pub const DEFAULT_HISTOGRAM_BINS: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBin {
    pub bin: usize,
    pub lower: f64,
    pub upper: f64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSummary {
    pub success_rate: f64,
    pub runs: usize,
    pub failed_trials: u32,
    pub first_failure_year: Option<u32>,
    pub ending_p10: f64,
    pub ending_p50: f64,
    pub ending_p90: f64,
    pub ending_histogram: Vec<HistogramBin>,
}

impl ResultsSummary {
    pub fn from_results(results: &SimulationResults, bins: usize) -> Self {
        let mut sorted = results.ending_balances.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        Self {
            success_rate: results.success_rate,
            runs: results.ending_balances.len(),
            failed_trials: results.failure_year_counts.iter().sum(),
            first_failure_year: first_failure_year(results),
            ending_p10: quantile(&sorted, 0.10),
            ending_p50: quantile(&sorted, 0.50),
            ending_p90: quantile(&sorted, 0.90),
            ending_histogram: ending_histogram(&results.ending_balances, bins),
        }
    }
}

/// Earliest simulation year in which any trial was ruined.
pub fn first_failure_year(results: &SimulationResults) -> Option<u32> {
    results
        .failure_year_counts
        .iter()
        .position(|&count| count > 0)
        .map(|idx| idx as u32 + 1)
}

/// Evenly spaced bins from zero to the largest balance. Values past the last
/// edge land in the final bin.
pub fn ending_histogram(balances: &[f64], bins: usize) -> Vec<HistogramBin> {
    let bins = bins.max(1);
    let max_value = balances.iter().copied().fold(0.0_f64, f64::max);
    let width = if max_value <= 0.0 {
        1.0
    } else {
        max_value / bins as f64
    };

    let mut histogram = (0..bins)
        .map(|bin| HistogramBin {
            bin,
            lower: bin as f64 * width,
            upper: (bin + 1) as f64 * width,
            count: 0,
        })
        .collect::<Vec<_>>();

    for &value in balances {
        let idx = ((value / width).floor().max(0.0) as usize).min(bins - 1);
        histogram[idx].count += 1;
    }
    histogram
}
