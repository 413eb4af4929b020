use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_YEARS: u32 = 1;
pub const MIN_RUNS: u32 = 100;
pub const MAX_YEARS: u32 = 200;
pub const MAX_RUNS: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonProfile {
    #[serde(default)]
    pub name: String,
    pub current_age: u32,
    pub retire_age: u32,
    pub benefit_start_age: u32,
    pub annual_benefit: f64,
}

impl PersonProfile {
    /// Age at the start of simulation year `year` (1-based). Widened so any
    /// `u32` age plus horizon fits without wrapping.
    pub fn age_in_year(&self, year: u32) -> u64 {
        self.current_age as u64 + year.saturating_sub(1) as u64
    }

    pub fn is_working_at(&self, age: u64) -> bool {
        age < self.retire_age as u64
    }

    pub fn benefit_at(&self, age: u64) -> f64 {
        if age >= self.benefit_start_age as u64 {
            self.annual_benefit
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdParameters {
    #[serde(default)]
    pub scenario_name: String,
    pub portfolio: f64,
    pub annual_spending: f64,
    pub annual_contribution: f64,
    pub stock_real_mean: f64,
    pub stock_vol: f64,
    pub bond_real_mean: f64,
    pub bond_vol: f64,
    pub stock_bond_corr: f64,
    pub stock_weight: f64,
    pub years: u32,
    pub runs: u32,
    pub seed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub household: HouseholdParameters,
    pub person_a: PersonProfile,
    pub person_b: PersonProfile,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            household: HouseholdParameters {
                scenario_name: "Base case".to_string(),
                portfolio: 800_000.0,
                annual_spending: 65_000.0,
                annual_contribution: 24_000.0,
                stock_real_mean: 0.055,
                stock_vol: 0.17,
                bond_real_mean: 0.02,
                bond_vol: 0.06,
                stock_bond_corr: 0.15,
                stock_weight: 0.70,
                years: 45,
                runs: 5_000,
                seed: 42,
            },
            person_a: PersonProfile {
                name: "You".to_string(),
                current_age: 40,
                retire_age: 55,
                benefit_start_age: 67,
                annual_benefit: 28_000.0,
            },
            person_b: PersonProfile {
                name: "Partner".to_string(),
                current_age: 38,
                retire_age: 55,
                benefit_start_age: 67,
                annual_benefit: 22_000.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScenarioError {
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("{field} must be >= 0, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("stockBondCorr must be between -1 and 1, got {0}")]
    CorrelationOutOfRange(f64),
    #[error("stockWeight must be between 0 and 1, got {0}")]
    StockWeightOutOfRange(f64),
    #[error("years must be <= {}, got {0}", MAX_YEARS)]
    TooManyYears(u32),
    #[error("runs must be <= {}, got {0}", MAX_RUNS)]
    TooManyRuns(u32),
}

impl Scenario {
    /// Boundary checks for scenarios arriving from the CLI or HTTP API. The
    /// engine itself accepts any scenario.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let h = &self.household;
        let finite = [
            ("portfolio", h.portfolio),
            ("annualSpending", h.annual_spending),
            ("annualContribution", h.annual_contribution),
            ("stockRealMean", h.stock_real_mean),
            ("stockVol", h.stock_vol),
            ("bondRealMean", h.bond_real_mean),
            ("bondVol", h.bond_vol),
            ("stockBondCorr", h.stock_bond_corr),
            ("stockWeight", h.stock_weight),
            ("personA.annualBenefit", self.person_a.annual_benefit),
            ("personB.annualBenefit", self.person_b.annual_benefit),
        ];
        if let Some(&(field, _)) = finite.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ScenarioError::NotFinite { field });
        }

        let non_negative = [
            ("annualSpending", h.annual_spending),
            ("annualContribution", h.annual_contribution),
            ("stockVol", h.stock_vol),
            ("bondVol", h.bond_vol),
            ("personA.annualBenefit", self.person_a.annual_benefit),
            ("personB.annualBenefit", self.person_b.annual_benefit),
        ];
        if let Some(&(field, value)) = non_negative.iter().find(|(_, v)| *v < 0.0) {
            return Err(ScenarioError::Negative { field, value });
        }

        if !(-1.0..=1.0).contains(&h.stock_bond_corr) {
            return Err(ScenarioError::CorrelationOutOfRange(h.stock_bond_corr));
        }
        if !(0.0..=1.0).contains(&h.stock_weight) {
            return Err(ScenarioError::StockWeightOutOfRange(h.stock_weight));
        }
        if h.years > MAX_YEARS {
            return Err(ScenarioError::TooManyYears(h.years));
        }
        if h.runs > MAX_RUNS {
            return Err(ScenarioError::TooManyRuns(h.runs));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentilePoint {
    pub year: u32,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResults {
    pub success_rate: f64,
    pub ending_balances: Vec<f64>,
    pub failure_year_counts: Vec<u32>,
    pub path_percentiles: Vec<PercentilePoint>,
}
