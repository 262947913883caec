//! The generation loop: evaluate, select, recombine, mutate, elitize.
//!
//! Evaluation fans out over a bounded rayon pool. All randomness for an
//! offspring comes from its own RNG stream, derived from the run seed,
//! the generation number, and the offspring's slot, so results are
//! identical for any worker count.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use rayon::prelude::*;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::population::{
    crossover, elite_order, mutate, tournament, Population, FRACTIONAL_SIGMA,
};
use super::{Candidate, GaParams, GenerationStats, RunMetrics, Termination};
use crate::simulator::{simulate, SimulationContext};
use crate::timegrid::SLOTS_PER_DAY;

pub struct GaEngine {
    params: GaParams,
    pool: rayon::ThreadPool,
}

impl GaEngine {
    pub fn new(params: GaParams) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.workers.max(1))
            .build()
            .context("failed to build evaluation worker pool")?;
        Ok(Self { params, pool })
    }

    pub fn params(&self) -> &GaParams {
        &self.params
    }

    /// Run one optimization. Returns the best candidate found and the
    /// per-generation record; never fails. Cancellation and the
    /// wall-clock budget are honored at generation boundaries.
    pub fn optimize(
        &self,
        ctx: &SimulationContext<'_>,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> (Candidate, RunMetrics) {
        let params = &self.params;
        let seed = params.seed.unwrap_or_else(rand::random::<u64>);
        let mut rng = StdRng::seed_from_u64(seed);
        let started = Instant::now();

        let masks: Vec<Vec<bool>> = ctx.devices.iter().map(|d| d.allowed_mask()).collect();
        let normal = Normal::new(0.0, FRACTIONAL_SIGMA).expect("sigma is positive");
        let n = params.population_size;
        let elite_count = ((params.elite_frac * n as f64).ceil() as usize).clamp(1, n);

        let mut pop = Population::init(n, ctx.devices, &masks, ctx.battery, &mut rng);
        self.evaluate(&mut pop, ctx);

        let mut best = pop.to_candidate(elite_order(&pop.fitness)[0]);
        let mut history = vec![generation_stats(best.fitness, &pop.fitness)];
        let mut generation = 1usize;
        let mut stall = 0usize;
        let mut termination = Termination::MaxGenerations;

        while generation < params.generations_max {
            if cancel.is_cancelled() {
                termination = Termination::Cancelled;
                break;
            }
            if started.elapsed() >= budget {
                termination = Termination::BudgetExhausted;
                break;
            }

            let stride = pop.layout.stride();
            let order = elite_order(&pop.fitness);
            let mut next = vec![0.0; pop.genes.len()];
            for (rank, &source) in order.iter().take(elite_count).enumerate() {
                next[rank * stride..(rank + 1) * stride].copy_from_slice(pop.candidate(source));
            }

            for child_index in elite_count..n {
                let mut child_rng = StdRng::seed_from_u64(stream_seed(
                    seed,
                    generation as u64,
                    child_index as u64,
                ));
                let parent_a = tournament(&pop.fitness, params.tournament_k, &mut child_rng);
                let parent_b = tournament(&pop.fitness, params.tournament_k, &mut child_rng);
                let child = &mut next[child_index * stride..(child_index + 1) * stride];
                if child_rng.gen_bool(params.p_cx) {
                    let point = child_rng.gen_range(1..SLOTS_PER_DAY);
                    crossover(
                        pop.candidate(parent_a),
                        pop.candidate(parent_b),
                        point,
                        child,
                        &pop.layout,
                    );
                } else {
                    child.copy_from_slice(pop.candidate(parent_a));
                }
                mutate(
                    child,
                    ctx.devices,
                    &masks,
                    ctx.battery,
                    params.p_mut,
                    &normal,
                    &pop.layout,
                    &mut child_rng,
                );
            }

            pop.genes = next;
            self.evaluate(&mut pop, ctx);
            generation += 1;

            let gen_best = elite_order(&pop.fitness)[0];
            let improvement = pop.fitness[gen_best] - best.fitness;
            if pop.fitness[gen_best] > best.fitness {
                best = pop.to_candidate(gen_best);
            }
            if improvement > params.epsilon_improve {
                stall = 0;
            } else {
                stall += 1;
            }
            history.push(generation_stats(best.fitness, &pop.fitness));

            if stall >= params.stall_gens {
                termination = Termination::Stalled;
                break;
            }
        }

        debug!(
            generations = generation,
            best_fitness = best.fitness,
            termination = ?termination,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "optimization finished"
        );

        let metrics = RunMetrics {
            generations_run: generation,
            best_fitness: best.fitness,
            history,
            termination,
        };
        (best, metrics)
    }

    fn evaluate(&self, pop: &mut Population, ctx: &SimulationContext<'_>) {
        let stride = pop.layout.stride();
        let offset = pop.layout.battery_offset();
        let genes = &pop.genes;
        let fitness = &mut pop.fitness;
        self.pool.install(|| {
            fitness.par_iter_mut().enumerate().for_each(|(i, slot)| {
                let row = &genes[i * stride..(i + 1) * stride];
                let (devices, battery) = row.split_at(offset);
                let result = simulate(devices, battery, ctx);
                // Non-finite fitness ranks below any finite value.
                *slot = if result.fitness.is_finite() {
                    result.fitness
                } else {
                    f64::NEG_INFINITY
                };
            });
        });
    }
}

fn generation_stats(best_so_far: f64, fitness: &[f64]) -> GenerationStats {
    let finite: Vec<f64> = fitness.iter().copied().filter(|f| f.is_finite()).collect();
    if finite.is_empty() {
        return GenerationStats { best: best_so_far, mean: f64::NEG_INFINITY, std_dev: 0.0 };
    }
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    let variance =
        finite.iter().map(|f| (f - mean) * (f - mean)).sum::<f64>() / finite.len() as f64;
    GenerationStats { best: best_so_far, mean, std_dev: variance.sqrt() }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Independent RNG stream per (run, generation, offspring slot).
fn stream_seed(seed: u64, generation: u64, child: u64) -> u64 {
    splitmix64(seed ^ splitmix64(generation ^ splitmix64(child)))
}
