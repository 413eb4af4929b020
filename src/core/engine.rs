use log::debug;
use rayon::prelude::*;

use super::rng::Rng;
use super::types::{MIN_RUNS, MIN_YEARS, PercentilePoint, Scenario, SimulationResults};

/// How random draws are distributed across trials.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RandomStreams {
    /// One stream consumed trial by trial, year by year.
    #[default]
    Shared,
    /// Each trial owns a stream derived from the seed and its index, so
    /// trials can run in parallel without changing the output.
    PerTrial,
}

#[derive(Debug, Clone, Copy)]
struct YearFlow {
    contribution: f64,
    income: f64,
}

#[derive(Debug, Clone, Copy)]
struct MarketModel {
    stock_mean: f64,
    stock_vol: f64,
    bond_mean: f64,
    bond_vol: f64,
    corr: f64,
    stock_weight: f64,
}

impl MarketModel {
    fn sample_return(&self, rng: &mut Rng) -> f64 {
        let z1 = rng.standard_normal();
        let z2 = rng.standard_normal();
        let zb = self.corr * z1 + (1.0 - self.corr * self.corr).max(0.0).sqrt() * z2;

        let stock_return = self.stock_mean + self.stock_vol * z1;
        let bond_return = self.bond_mean + self.bond_vol * zb;
        self.stock_weight * stock_return + (1.0 - self.stock_weight) * bond_return
    }
}

/// Everything a trial needs, resolved once per run.
#[derive(Debug)]
struct TrialPlan {
    years: u32,
    runs: u32,
    seed: u32,
    start_balance: f64,
    annual_spending: f64,
    flows: Vec<YearFlow>,
    market: MarketModel,
}

impl TrialPlan {
    fn from_scenario(scenario: &Scenario) -> Self {
        let household = &scenario.household;
        let years = household.years.max(MIN_YEARS);
        let runs = household.runs.max(MIN_RUNS);
        let people = [&scenario.person_a, &scenario.person_b];

        let flows = (1..=years)
            .map(|year| {
                let anyone_working = people
                    .iter()
                    .any(|p| p.is_working_at(p.age_in_year(year)));
                let income = people
                    .iter()
                    .map(|p| p.benefit_at(p.age_in_year(year)))
                    .sum::<f64>();
                YearFlow {
                    contribution: if anyone_working {
                        household.annual_contribution
                    } else {
                        0.0
                    },
                    income,
                }
            })
            .collect();

        Self {
            years,
            runs,
            seed: household.seed,
            start_balance: household.portfolio,
            annual_spending: household.annual_spending,
            flows,
            market: MarketModel {
                stock_mean: household.stock_real_mean,
                stock_vol: household.stock_vol,
                bond_mean: household.bond_real_mean,
                bond_vol: household.bond_vol,
                corr: household.stock_bond_corr.clamp(-1.0, 1.0),
                stock_weight: household.stock_weight,
            },
        }
    }
}

/// One trial's balance path: `samples[0]` is the starting balance and the
/// path is zero-filled after ruin, so it always holds `years + 1` entries.
#[derive(Debug, Clone, PartialEq)]
struct TrialOutcome {
    ruin_year: Option<u32>,
    samples: Vec<f64>,
}

impl TrialOutcome {
    fn ruined(mut samples: Vec<f64>, year: u32, years: u32) -> Self {
        samples.resize(years as usize + 1, 0.0);
        Self {
            ruin_year: Some(year),
            samples,
        }
    }

    fn ending_balance(&self) -> f64 {
        self.samples.last().copied().unwrap_or(0.0)
    }
}

pub fn run_simulation(scenario: &Scenario) -> SimulationResults {
    run_simulation_with(scenario, RandomStreams::Shared)
}

pub fn run_simulation_with(scenario: &Scenario, streams: RandomStreams) -> SimulationResults {
    let plan = TrialPlan::from_scenario(scenario);

    let outcomes = match streams {
        RandomStreams::Shared => {
            let mut rng = Rng::new(plan.seed);
            (0..plan.runs)
                .map(|_| simulate_trial(&plan, &mut rng))
                .collect::<Vec<_>>()
        }
        RandomStreams::PerTrial => (0..plan.runs)
            .into_par_iter()
            .map(|trial| {
                let mut rng = Rng::for_trial(plan.seed, trial);
                simulate_trial(&plan, &mut rng)
            })
            .collect::<Vec<_>>(),
    };

    let results = aggregate(&plan, &outcomes);
    debug!(
        "simulated {} trials over {} years ({:?} streams): success rate {:.4}",
        plan.runs, plan.years, streams, results.success_rate
    );
    results
}

fn simulate_trial(plan: &TrialPlan, rng: &mut Rng) -> TrialOutcome {
    let mut samples = Vec::with_capacity(plan.years as usize + 1);
    let mut balance = plan.start_balance;
    samples.push(balance);

    for (year, flow) in (1..=plan.years).zip(&plan.flows) {
        balance = balance + flow.contribution - plan.annual_spending + flow.income;
        if balance <= 0.0 {
            return TrialOutcome::ruined(samples, year, plan.years);
        }

        balance *= 1.0 + plan.market.sample_return(rng);
        if balance <= 0.0 {
            return TrialOutcome::ruined(samples, year, plan.years);
        }

        samples.push(balance);
    }

    TrialOutcome {
        ruin_year: None,
        samples,
    }
}

fn aggregate(plan: &TrialPlan, outcomes: &[TrialOutcome]) -> SimulationResults {
    let year_count = plan.years as usize + 1;
    let mut by_year = (0..year_count)
        .map(|_| Vec::with_capacity(outcomes.len()))
        .collect::<Vec<Vec<f64>>>();
    let mut failure_year_counts = vec![0_u32; plan.years as usize];
    let mut ending_balances = Vec::with_capacity(outcomes.len());
    let mut successes = 0_u32;

    for outcome in outcomes {
        for (idx, &sample) in outcome.samples.iter().enumerate() {
            by_year[idx].push(sample);
        }
        match outcome.ruin_year {
            Some(year) => failure_year_counts[year as usize - 1] += 1,
            None => successes += 1,
        }
        ending_balances.push(outcome.ending_balance());
    }

    let path_percentiles = by_year
        .iter_mut()
        .enumerate()
        .map(|(year, values)| {
            values.sort_by(|a, b| a.total_cmp(b));
            PercentilePoint {
                year: year as u32,
                p10: quantile(values, 0.10),
                p50: quantile(values, 0.50),
                p90: quantile(values, 0.90),
            }
        })
        .collect();

    SimulationResults {
        success_rate: successes as f64 / plan.runs as f64,
        ending_balances,
        failure_year_counts,
        path_percentiles,
    }
}

/// Linearly interpolated quantile of an ascending slice; `q` in `[0, 1]`.
pub(crate) fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let rank = (sorted.len() - 1) as f64 * q;
    let lower = rank.floor() as usize;
    let upper = rank.ceil().min((sorted.len() - 1) as f64) as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let w = rank - lower as f64;
        (sorted[lower] + w * (sorted[upper] - sorted[lower]))
            .max(sorted[lower])
            .min(sorted[upper])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{HouseholdParameters, MAX_YEARS, PersonProfile};
    use proptest::prelude::{Just, prop_assert, prop_assert_eq, prop_oneof, proptest};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn person(
        current_age: u32,
        retire_age: u32,
        benefit_start_age: u32,
        benefit: f64,
    ) -> PersonProfile {
        PersonProfile {
            name: String::new(),
            current_age,
            retire_age,
            benefit_start_age,
            annual_benefit: benefit,
        }
    }

    fn sample_scenario() -> Scenario {
        Scenario {
            household: HouseholdParameters {
                scenario_name: "test".to_string(),
                portfolio: 500_000.0,
                annual_spending: 30_000.0,
                annual_contribution: 10_000.0,
                stock_real_mean: 0.05,
                stock_vol: 0.15,
                bond_real_mean: 0.02,
                bond_vol: 0.05,
                stock_bond_corr: 0.2,
                stock_weight: 0.6,
                years: 30,
                runs: 300,
                seed: 7,
            },
            person_a: person(50, 60, 67, 20_000.0),
            person_b: person(48, 58, 67, 15_000.0),
        }
    }

    /// No market movement and no cash flows unless a test adds them.
    fn flat_scenario() -> Scenario {
        let mut scenario = sample_scenario();
        let h = &mut scenario.household;
        h.portfolio = 100_000.0;
        h.annual_spending = 0.0;
        h.annual_contribution = 0.0;
        h.stock_real_mean = 0.0;
        h.stock_vol = 0.0;
        h.bond_real_mean = 0.0;
        h.bond_vol = 0.0;
        h.years = 10;
        h.runs = 100;
        scenario.person_a = person(40, 30, 200, 0.0);
        scenario.person_b = person(40, 30, 200, 0.0);
        scenario
    }

    #[test]
    fn quantile_interpolates_between_points() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_approx(quantile(&values, 0.25), 1.75);
        assert_approx(quantile(&values, 0.5), 2.5);
        assert_approx(quantile(&values, 0.0), 1.0);
        assert_approx(quantile(&values, 1.0), 4.0);
    }

    #[test]
    fn quantile_handles_empty_and_single_samples() {
        assert_eq!(quantile(&[], 0.5), 0.0);
        assert_eq!(quantile(&[3.5], 0.9), 3.5);
    }

    #[test]
    fn identical_inputs_give_identical_results() {
        let scenario = sample_scenario();
        assert_eq!(run_simulation(&scenario), run_simulation(&scenario));
    }

    #[test]
    fn different_seeds_give_different_paths() {
        let scenario = sample_scenario();
        let mut other = scenario.clone();
        other.household.seed = 8;
        assert_ne!(
            run_simulation(&scenario).ending_balances,
            run_simulation(&other).ending_balances
        );
    }

    #[test]
    fn no_growth_scenario_stays_at_starting_balance() {
        let results = run_simulation(&flat_scenario());
        assert_eq!(results.success_rate, 1.0);
        assert_eq!(results.path_percentiles.len(), 11);
        for point in &results.path_percentiles {
            assert_eq!(point.p10, 100_000.0);
            assert_eq!(point.p50, 100_000.0);
            assert_eq!(point.p90, 100_000.0);
        }
        assert!(results.ending_balances.iter().all(|&b| b == 100_000.0));
        assert!(results.failure_year_counts.iter().all(|&c| c == 0));
    }

    #[test]
    fn overwhelming_spending_ruins_every_trial_in_year_one() {
        let mut scenario = flat_scenario();
        scenario.household.portfolio = 1_000.0;
        scenario.household.annual_spending = 1_000_000.0;
        scenario.household.stock_vol = 0.2;
        scenario.household.bond_vol = 0.05;
        scenario.household.years = 5;
        scenario.household.runs = 100;

        let results = run_simulation(&scenario);
        assert_eq!(results.success_rate, 0.0);
        assert_eq!(results.failure_year_counts, vec![100, 0, 0, 0, 0]);
        assert_eq!(results.ending_balances.len(), 100);
        assert!(results.ending_balances.iter().all(|&b| b == 0.0));
        for point in &results.path_percentiles[1..] {
            assert_eq!((point.p10, point.p50, point.p90), (0.0, 0.0, 0.0));
        }
        assert_eq!(results.path_percentiles[0].p50, 1_000.0);
    }

    #[test]
    fn runs_and_years_are_floored_to_minimums() {
        let mut scenario = flat_scenario();
        scenario.household.runs = 10;
        scenario.household.years = 0;

        let results = run_simulation(&scenario);
        assert_eq!(results.ending_balances.len(), 100);
        assert_eq!(results.failure_year_counts.len(), 1);
        assert_eq!(results.path_percentiles.len(), 2);
    }

    #[test]
    fn contributions_stop_exactly_at_retirement_age() {
        let mut scenario = flat_scenario();
        scenario.household.annual_contribution = 1_000.0;
        scenario.household.years = 5;
        scenario.person_a = person(60, 63, 200, 0.0);
        scenario.person_b = person(40, 30, 200, 0.0);

        let results = run_simulation(&scenario);
        let medians = results
            .path_percentiles
            .iter()
            .map(|p| p.p50)
            .collect::<Vec<_>>();
        // Ages 60, 61, 62 contribute; age 63 (year 4) is retired.
        assert_eq!(
            medians,
            vec![100_000.0, 101_000.0, 102_000.0, 103_000.0, 103_000.0, 103_000.0]
        );
    }

    #[test]
    fn contributions_continue_while_either_person_works() {
        let mut scenario = flat_scenario();
        scenario.household.annual_contribution = 1_000.0;
        scenario.household.years = 3;
        scenario.person_a = person(60, 60, 200, 0.0);
        scenario.person_b = person(50, 52, 200, 0.0);

        let results = run_simulation(&scenario);
        let medians = results
            .path_percentiles
            .iter()
            .map(|p| p.p50)
            .collect::<Vec<_>>();
        assert_eq!(medians, vec![100_000.0, 101_000.0, 102_000.0, 102_000.0]);
    }

    #[test]
    fn benefits_start_exactly_at_benefit_age() {
        let mut scenario = flat_scenario();
        scenario.household.years = 4;
        scenario.person_a = person(65, 30, 67, 500.0);
        scenario.person_b = person(60, 30, 62, 250.0);

        let results = run_simulation(&scenario);
        let medians = results
            .path_percentiles
            .iter()
            .map(|p| p.p50)
            .collect::<Vec<_>>();
        // Year 3: A turns 67 and B turns 62 at the start of the year.
        assert_eq!(
            medians,
            vec![100_000.0, 100_000.0, 100_000.0, 100_750.0, 101_500.0]
        );
    }

    #[test]
    fn ruin_after_growth_is_recorded_in_that_year() {
        let mut scenario = flat_scenario();
        scenario.household.portfolio = 1_000.0;
        scenario.household.stock_weight = 1.0;
        scenario.household.stock_real_mean = -1.5;
        scenario.household.years = 3;

        let results = run_simulation(&scenario);
        assert_eq!(results.success_rate, 0.0);
        assert_eq!(results.failure_year_counts, vec![100, 0, 0]);
        assert!(results.ending_balances.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn spending_exhausts_balance_in_the_expected_year() {
        let mut scenario = flat_scenario();
        scenario.household.portfolio = 10_000.0;
        scenario.household.annual_spending = 4_000.0;
        scenario.household.years = 5;

        let results = run_simulation(&scenario);
        // 10k -> 6k -> 2k -> ruin in year 3.
        assert_eq!(results.failure_year_counts, vec![0, 0, 100, 0, 0]);
        let medians = results
            .path_percentiles
            .iter()
            .map(|p| p.p50)
            .collect::<Vec<_>>();
        assert_eq!(medians, vec![10_000.0, 6_000.0, 2_000.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn balance_exactly_zero_counts_as_ruin() {
        let mut scenario = flat_scenario();
        scenario.household.portfolio = 5_000.0;
        scenario.household.annual_spending = 5_000.0;
        scenario.household.years = 2;

        let results = run_simulation(&scenario);
        assert_eq!(results.success_rate, 0.0);
        assert_eq!(results.failure_year_counts, vec![100, 0]);
    }

    #[test]
    fn correlation_is_clamped_to_unit_range() {
        let mut scenario = sample_scenario();
        scenario.household.stock_bond_corr = 1.0;
        let clamped_input = run_simulation(&scenario);

        scenario.household.stock_bond_corr = 3.0;
        let out_of_range = run_simulation(&scenario);
        assert_eq!(clamped_input, out_of_range);

        let plan = TrialPlan::from_scenario(&scenario);
        assert_eq!(plan.market.corr, 1.0);
    }

    #[test]
    fn perfectly_correlated_blend_matches_single_factor() {
        let market = MarketModel {
            stock_mean: 0.05,
            stock_vol: 0.2,
            bond_mean: 0.01,
            bond_vol: 0.1,
            corr: 1.0,
            stock_weight: 0.5,
        };
        let mut rng = Rng::new(3);
        let mut replay = Rng::new(3);
        let r = market.sample_return(&mut rng);
        let z1 = replay.standard_normal();
        let _ = replay.standard_normal();
        assert_approx(r, 0.5 * (0.05 + 0.2 * z1) + 0.5 * (0.01 + 0.1 * z1));
    }

    #[test]
    fn ruined_trials_stop_drawing_from_the_shared_stream() {
        let plan = TrialPlan::from_scenario(&{
            let mut scenario = flat_scenario();
            scenario.household.portfolio = 1.0;
            scenario.household.annual_spending = 10.0;
            scenario
        });
        let mut rng = Rng::new(11);
        let mut untouched = Rng::new(11);
        let outcome = simulate_trial(&plan, &mut rng);
        assert_eq!(outcome.ruin_year, Some(1));
        assert_eq!(outcome.samples.len(), 11);
        assert_eq!(
            rng.next_uniform().to_bits(),
            untouched.next_uniform().to_bits()
        );
    }

    #[test]
    fn per_trial_streams_are_deterministic_and_distinct_from_shared() {
        let scenario = sample_scenario();
        let a = run_simulation_with(&scenario, RandomStreams::PerTrial);
        let b = run_simulation_with(&scenario, RandomStreams::PerTrial);
        assert_eq!(a, b);
        assert_eq!(a.ending_balances.len(), 300);
        assert_ne!(a.ending_balances, run_simulation(&scenario).ending_balances);
    }

    #[test]
    fn per_trial_mode_matches_sequential_per_trial_replay() {
        let scenario = sample_scenario();
        let plan = TrialPlan::from_scenario(&scenario);
        let expected = (0..plan.runs)
            .map(|trial| {
                let mut rng = Rng::for_trial(plan.seed, trial);
                simulate_trial(&plan, &mut rng).ending_balance()
            })
            .collect::<Vec<_>>();
        let results = run_simulation_with(&scenario, RandomStreams::PerTrial);
        assert_eq!(results.ending_balances, expected);
    }

    #[test]
    fn default_scenario_produces_plausible_success_rate() {
        let results = run_simulation(&Scenario::default());
        assert_eq!(results.ending_balances.len(), 5_000);
        assert!(results.success_rate > 0.2 && results.success_rate < 1.0);
    }

    #[test]
    fn ages_near_u32_max_run_without_wrapping() {
        let mut scenario = flat_scenario();
        scenario.household.years = 3;
        scenario.household.annual_contribution = 1_000.0;
        scenario.person_a = person(u32::MAX, 65, 67, 500.0);
        scenario.person_b = person(u32::MAX - 1, 65, 67, 0.0);
        assert!(scenario.validate().is_ok());

        let results = run_simulation(&scenario);
        let medians = results
            .path_percentiles
            .iter()
            .map(|p| p.p50)
            .collect::<Vec<_>>();
        // Both are past retirement and A is past benefit age every year.
        assert_eq!(medians, vec![100_000.0, 100_500.0, 101_000.0, 101_500.0]);
        assert_eq!(results.success_rate, 1.0);
    }

    #[test]
    fn longest_allowed_horizon_runs_to_completion() {
        let mut scenario = sample_scenario();
        scenario.household.years = MAX_YEARS;
        scenario.household.runs = 100;
        scenario.person_a = person(90, 0, 0, 20_000.0);
        scenario.person_b = person(0, 0, u32::MAX, 20_000.0);
        assert!(scenario.validate().is_ok());

        let results = run_simulation(&scenario);
        assert_eq!(results.path_percentiles.len(), MAX_YEARS as usize + 1);
        assert_eq!(results.failure_year_counts.len(), MAX_YEARS as usize);
    }

    proptest! {
        #[test]
        fn extreme_ages_never_panic_and_keep_invariants(
            seed in 0_u32..1_000,
            years in 0_u32..=MAX_YEARS,
            a_age in prop_oneof![0_u32..120, (u32::MAX - 300)..=u32::MAX],
            b_age in prop_oneof![0_u32..120, (u32::MAX - 300)..=u32::MAX],
            a_retire in prop_oneof![0_u32..120, Just(u32::MAX)],
            b_retire in prop_oneof![0_u32..120, Just(u32::MAX)],
            a_benefit_age in prop_oneof![0_u32..120, Just(u32::MAX)],
            b_benefit_age in prop_oneof![0_u32..120, Just(u32::MAX)],
        ) {
            let mut scenario = sample_scenario();
            scenario.household.seed = seed;
            scenario.household.years = years;
            scenario.household.runs = 100;
            scenario.person_a = person(a_age, a_retire, a_benefit_age, 20_000.0);
            scenario.person_b = person(b_age, b_retire, b_benefit_age, 15_000.0);

            let results = run_simulation(&scenario);
            let years = years.max(1) as usize;
            prop_assert_eq!(results.ending_balances.len(), 100);
            prop_assert_eq!(results.path_percentiles.len(), years + 1);
            let failed = results.failure_year_counts.iter().sum::<u32>();
            prop_assert!((results.success_rate - (1.0 - failed as f64 / 100.0)).abs() < 1e-12);
            for point in &results.path_percentiles {
                prop_assert!(point.p10 <= point.p50 && point.p50 <= point.p90);
            }
        }

        #[test]
        fn aggregate_invariants_hold(
            seed in 0_u32..10_000,
            years in 0_u32..40,
            runs in 0_u32..250,
            spending in 0.0_f64..80_000.0,
            stock_weight in 0.0_f64..=1.0,
            corr in -1.0_f64..=1.0,
            streams_per_trial in proptest::bool::ANY,
        ) {
            let mut scenario = sample_scenario();
            scenario.household.seed = seed;
            scenario.household.years = years;
            scenario.household.runs = runs;
            scenario.household.annual_spending = spending;
            scenario.household.stock_weight = stock_weight;
            scenario.household.stock_bond_corr = corr;
            let streams = if streams_per_trial {
                RandomStreams::PerTrial
            } else {
                RandomStreams::Shared
            };

            let results = run_simulation_with(&scenario, streams);
            let runs = runs.max(100) as usize;
            let years = years.max(1) as usize;

            prop_assert_eq!(results.ending_balances.len(), runs);
            prop_assert_eq!(results.failure_year_counts.len(), years);
            prop_assert_eq!(results.path_percentiles.len(), years + 1);
            prop_assert!((0.0..=1.0).contains(&results.success_rate));
            prop_assert!(results.ending_balances.iter().all(|&b| b >= 0.0));

            let failed = results.failure_year_counts.iter().sum::<u32>() as usize;
            let zero_endings = results.ending_balances.iter().filter(|&&b| b == 0.0).count();
            prop_assert_eq!(failed, zero_endings);
            prop_assert!((results.success_rate - (1.0 - failed as f64 / runs as f64)).abs() < 1e-12);

            for (idx, point) in results.path_percentiles.iter().enumerate() {
                prop_assert_eq!(point.year as usize, idx);
                prop_assert!(point.p10 <= point.p50);
                prop_assert!(point.p50 <= point.p90);
            }
        }
    }
}
