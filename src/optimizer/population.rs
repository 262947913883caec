//! Population storage and the genetic operators.
//!
//! Genes live in one contiguous buffer, one stride per candidate, laid
//! out as the device rows followed by the battery row. Evaluation reads
//! slices straight out of the buffer.

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::cmp::Reverse;

use crate::domain::{BatterySpec, DeviceControl, DeviceSpec};
use crate::optimizer::Candidate;
use crate::timegrid::SLOTS_PER_DAY;

/// Gaussian sigma for fractional-gene mutation, proportional to the
/// [0, 1] gene range.
pub(crate) const FRACTIONAL_SIGMA: f64 = 0.2;

/// Uniform half-range for battery-gene mutation, as a fraction of the
/// battery's larger rate limit.
pub(crate) const BATTERY_NOISE_FRAC: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct GeneLayout {
    pub n_devices: usize,
}

impl GeneLayout {
    pub fn battery_offset(&self) -> usize {
        self.n_devices * SLOTS_PER_DAY
    }

    pub fn stride(&self) -> usize {
        (self.n_devices + 1) * SLOTS_PER_DAY
    }
}

pub(crate) struct Population {
    pub layout: GeneLayout,
    pub size: usize,
    pub genes: Vec<f64>,
    pub fitness: Vec<f64>,
}

impl Population {
    /// Seed a random population. Binary genes are Bernoulli(0.5) inside
    /// the device window and zero outside; fractional genes uniform in
    /// [0, 1]; battery genes uniform across the rate span.
    pub fn init(
        size: usize,
        devices: &[DeviceSpec],
        masks: &[Vec<bool>],
        battery: &BatterySpec,
        rng: &mut StdRng,
    ) -> Self {
        let layout = GeneLayout { n_devices: devices.len() };
        let stride = layout.stride();
        let mut genes = vec![0.0; size * stride];

        for i in 0..size {
            let candidate = &mut genes[i * stride..(i + 1) * stride];
            for (d, spec) in devices.iter().enumerate() {
                for t in 0..SLOTS_PER_DAY {
                    if !masks[d][t] {
                        continue;
                    }
                    candidate[d * SLOTS_PER_DAY + t] = match spec.control {
                        DeviceControl::Binary => {
                            if rng.gen_bool(0.5) {
                                1.0
                            } else {
                                0.0
                            }
                        }
                        DeviceControl::Fractional => rng.gen::<f64>(),
                    };
                }
            }
            let offset = layout.battery_offset();
            for t in 0..SLOTS_PER_DAY {
                candidate[offset + t] =
                    rng.gen_range(-battery.max_discharge_kw..=battery.max_charge_kw);
            }
        }

        Self { layout, size, genes, fitness: vec![f64::NEG_INFINITY; size] }
    }

    pub fn candidate(&self, index: usize) -> &[f64] {
        let stride = self.layout.stride();
        &self.genes[index * stride..(index + 1) * stride]
    }

    pub fn to_candidate(&self, index: usize) -> Candidate {
        let (devices, battery) = self.candidate(index).split_at(self.layout.battery_offset());
        Candidate {
            device_activity: devices.to_vec(),
            battery_kw: battery.to_vec(),
            fitness: self.fitness[index],
        }
    }
}

/// Tournament selection: sample `k` distinct candidates, return the best.
/// Ties resolve to the lower index.
pub(crate) fn tournament(fitness: &[f64], k: usize, rng: &mut StdRng) -> usize {
    let n = fitness.len();
    let k = k.clamp(1, n);
    let mut picked: Vec<usize> = Vec::with_capacity(k);
    while picked.len() < k {
        let index = rng.gen_range(0..n);
        if !picked.contains(&index) {
            picked.push(index);
        }
    }
    let mut best = picked[0];
    for &index in &picked[1..] {
        if fitness[index] > fitness[best] || (fitness[index] == fitness[best] && index < best) {
            best = index;
        }
    }
    best
}

/// Single-point crossover at `point` in `[1, 96)`, applied at the same
/// point in every row to preserve temporal coherence.
pub(crate) fn crossover(a: &[f64], b: &[f64], point: usize, child: &mut [f64], layout: &GeneLayout) {
    debug_assert!((1..SLOTS_PER_DAY).contains(&point));
    for row in 0..=layout.n_devices {
        let base = row * SLOTS_PER_DAY;
        child[base..base + point].copy_from_slice(&a[base..base + point]);
        child[base + point..base + SLOTS_PER_DAY]
            .copy_from_slice(&b[base + point..base + SLOTS_PER_DAY]);
    }
}

/// Per-gene mutation. Binary genes flip, fractional genes take Gaussian
/// noise, battery genes take uniform noise; everything re-clamps to its
/// bounds and window masks stay enforced.
#[allow(clippy::too_many_arguments)]
pub(crate) fn mutate(
    child: &mut [f64],
    devices: &[DeviceSpec],
    masks: &[Vec<bool>],
    battery: &BatterySpec,
    p_mut: f64,
    normal: &Normal<f64>,
    layout: &GeneLayout,
    rng: &mut StdRng,
) {
    for (d, spec) in devices.iter().enumerate() {
        for t in 0..SLOTS_PER_DAY {
            let gene = &mut child[d * SLOTS_PER_DAY + t];
            if !masks[d][t] {
                *gene = 0.0;
                continue;
            }
            if !rng.gen_bool(p_mut) {
                continue;
            }
            match spec.control {
                DeviceControl::Binary => *gene = if *gene >= 0.5 { 0.0 } else { 1.0 },
                DeviceControl::Fractional => {
                    *gene = (*gene + normal.sample(rng)).clamp(0.0, 1.0);
                }
            }
        }
    }

    let offset = layout.battery_offset();
    let span = battery.max_rate_kw();
    for t in 0..SLOTS_PER_DAY {
        let gene = &mut child[offset + t];
        if rng.gen_bool(p_mut) {
            *gene += rng.gen_range(-BATTERY_NOISE_FRAC..=BATTERY_NOISE_FRAC) * span;
        }
        *gene = gene.clamp(-battery.max_discharge_kw, battery.max_charge_kw);
    }
}

/// Candidate indices ordered best-first. The sort is stable, so equal
/// fitness keeps the lower index in front.
pub(crate) fn elite_order(fitness: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..fitness.len()).collect();
    order.sort_by_key(|&i| Reverse(OrderedFloat(fitness[i])));
    order
}
