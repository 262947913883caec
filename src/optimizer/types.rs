use serde::{Deserialize, Serialize};

use crate::domain::{DispatchPlan, SlotSeries};
use crate::timegrid::SLOTS_PER_DAY;

/// Genetic-search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaParams {
    pub population_size: usize,
    pub generations_max: usize,
    pub p_cx: f64,
    pub p_mut: f64,
    pub elite_frac: f64,
    pub stall_gens: usize,
    pub tournament_k: usize,
    /// Minimum best-fitness gain that counts as progress for the stall
    /// detector.
    pub epsilon_improve: f64,
    /// Fixed PRNG seed for reproducible runs; `None` draws one at random.
    pub seed: Option<u64>,
    /// Evaluation worker threads.
    pub workers: usize,
}

impl Default for GaParams {
    fn default() -> Self {
        Self {
            population_size: 100,
            generations_max: 200,
            p_cx: 0.8,
            p_mut: 0.05,
            elite_frac: 0.2,
            stall_gens: 20,
            tournament_k: 3,
            epsilon_improve: 1e-9,
            seed: None,
            workers: default_workers(),
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

/// Why an optimization run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    MaxGenerations,
    Stalled,
    BudgetExhausted,
    Cancelled,
}

/// Fitness statistics for one generation. `best` is the best fitness seen
/// so far in the run, so the series is non-decreasing by construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationStats {
    pub best: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Per-run convergence record returned alongside the best candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub generations_run: usize,
    pub best_fitness: f64,
    pub history: Vec<GenerationStats>,
    pub termination: Termination,
}

/// One proposed 24-hour schedule: flattened device rows plus the battery
/// dispatch row.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Row-major, one 96-value row per device.
    pub device_activity: Vec<f64>,
    pub battery_kw: Vec<f64>,
    pub fitness: f64,
}

impl Candidate {
    pub fn into_plan(self) -> DispatchPlan {
        let device_activity = self
            .device_activity
            .chunks_exact(SLOTS_PER_DAY)
            .map(|row| SlotSeries::from_vec(row.to_vec()).unwrap_or_else(|_| SlotSeries::zeros()))
            .collect();
        let battery_kw =
            SlotSeries::from_vec(self.battery_kw).unwrap_or_else(|_| SlotSeries::zeros());
        DispatchPlan { device_activity, battery_kw }
    }
}
