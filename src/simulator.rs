//! Deterministic slot-by-slot dispatch simulation.
//!
//! Pure function of the candidate and its inputs: identical inputs give
//! identical fitness, which the optimizer's reproducibility and the
//! forecast caches both rely on.

use serde::{Deserialize, Serialize};

use crate::domain::{BatterySpec, DeviceSpec, SlotSeries};
use crate::timegrid::{SLOTS_PER_DAY, SLOT_HOURS};

/// Quadratic scale for windowed-energy shortfall, chosen so one missing
/// kWh outweighs any realistic daily cost saving.
const SHORTFALL_PENALTY_SCALE: f64 = 100.0;

/// Penalty per SOC-bound clamp.
const CLAMP_PENALTY: f64 = 0.01;

/// Penalty per slot missing from a too-short contiguous run.
const SHORT_RUN_PENALTY: f64 = 0.25;

/// Relative weights of the fitness terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessWeights {
    pub cost: f64,
    pub penalty: f64,
    pub cycles: f64,
    pub peak: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self { cost: 1.0, penalty: 1.0, cycles: 0.05, peak: 0.1 }
    }
}

/// Everything a candidate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct SimulationContext<'a> {
    pub pv: &'a SlotSeries,
    pub load: &'a SlotSeries,
    pub price: &'a SlotSeries,
    pub battery: &'a BatterySpec,
    pub devices: &'a [DeviceSpec],
    pub weights: FitnessWeights,
    pub export_price_eur_per_kwh: f64,
}

/// Aggregate metrics for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimulationResult {
    pub energy_cost_eur: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub battery_cycle_depth: f64,
    pub peak_import_kw: f64,
    pub constraint_penalty: f64,
    pub soc_clamps: u32,
    pub fitness: f64,
}

/// Per-slot energy flows, recorded when a trace is requested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlotStep {
    pub device_load_kw: f64,
    pub battery_kw: f64,
    pub grid_import_kw: f64,
    pub grid_export_kw: f64,
    pub soc: f64,
}

/// Evaluate a candidate. `device_activity` is row-major, one 96-value row
/// per device in `ctx.devices` order; `battery_kw` is the dispatch row,
/// positive charging.
pub fn simulate(device_activity: &[f64], battery_kw: &[f64], ctx: &SimulationContext<'_>) -> SimulationResult {
    simulate_inner(device_activity, battery_kw, ctx, None)
}

/// Like [`simulate`], also returning the per-slot flow trace.
pub fn simulate_traced(
    device_activity: &[f64],
    battery_kw: &[f64],
    ctx: &SimulationContext<'_>,
) -> (SimulationResult, Vec<SlotStep>) {
    let mut trace = Vec::with_capacity(SLOTS_PER_DAY);
    let result = simulate_inner(device_activity, battery_kw, ctx, Some(&mut trace));
    (result, trace)
}

fn simulate_inner(
    device_activity: &[f64],
    battery_kw: &[f64],
    ctx: &SimulationContext<'_>,
    mut trace: Option<&mut Vec<SlotStep>>,
) -> SimulationResult {
    debug_assert_eq!(device_activity.len(), ctx.devices.len() * SLOTS_PER_DAY);
    debug_assert_eq!(battery_kw.len(), SLOTS_PER_DAY);

    let battery = ctx.battery;
    let capacity = battery.capacity_kwh;

    let mut soc = battery.initial_soc;
    let mut soc_low = soc;
    let mut soc_high = soc;
    let mut soc_clamps = 0u32;

    let mut cost = 0.0;
    let mut import_kwh = 0.0;
    let mut export_kwh = 0.0;
    let mut peak_import_kw: f64 = 0.0;

    for t in 0..SLOTS_PER_DAY {
        let mut device_load = 0.0;
        for (d, spec) in ctx.devices.iter().enumerate() {
            device_load += device_activity[d * SLOTS_PER_DAY + t] * spec.power_kw;
        }

        let net_before = ctx.pv[t] - (ctx.load[t] + device_load);

        let commanded = battery_kw[t];
        let mut applied = commanded.clamp(-battery.max_discharge_kw, battery.max_charge_kw);
        if capacity <= 0.0 {
            if applied != 0.0 {
                soc_clamps += 1;
            }
            applied = 0.0;
        } else {
            let internal = if applied >= 0.0 {
                applied * battery.round_trip_eff
            } else {
                applied
            };
            let unclamped = soc + internal * SLOT_HOURS / capacity;
            soc = unclamped.clamp(battery.soc_min, battery.soc_max);
            if (soc - unclamped).abs() > 1e-12 {
                soc_clamps += 1;
            }
        }
        soc_low = soc_low.min(soc);
        soc_high = soc_high.max(soc);

        let net_after = net_before - applied;
        let grid_import = (-net_after).max(0.0);
        let grid_export = net_after.max(0.0);

        cost += grid_import * ctx.price[t] * SLOT_HOURS
            - grid_export * ctx.export_price_eur_per_kwh * SLOT_HOURS;
        import_kwh += grid_import * SLOT_HOURS;
        export_kwh += grid_export * SLOT_HOURS;
        peak_import_kw = peak_import_kw.max(grid_import);

        if let Some(trace) = trace.as_deref_mut() {
            trace.push(SlotStep {
                device_load_kw: device_load,
                battery_kw: applied,
                grid_import_kw: grid_import,
                grid_export_kw: grid_export,
                soc,
            });
        }
    }

    let mut penalty = f64::from(soc_clamps) * CLAMP_PENALTY;
    for (d, spec) in ctx.devices.iter().enumerate() {
        let Some(window) = &spec.window else { continue };
        let row = &device_activity[d * SLOTS_PER_DAY..(d + 1) * SLOTS_PER_DAY];
        let delivered: f64 = row
            .iter()
            .take(window.latest_slot.min(SLOTS_PER_DAY))
            .skip(window.earliest_slot)
            .map(|a| a * spec.power_kw * SLOT_HOURS)
            .sum();
        let shortfall = (window.required_energy_kwh - delivered).max(0.0);
        // Higher-priority devices are penalized harder for missed energy.
        let priority_scale = 0.5 + 0.5 * spec.priority.clamp(0.0, 1.0);
        penalty += SHORTFALL_PENALTY_SCALE * priority_scale * shortfall * shortfall;

        // Discourage switching bursts shorter than the minimum runtime.
        if window.min_runtime_slots > 1 {
            let mut run = 0usize;
            for t in 0..=SLOTS_PER_DAY {
                let on = t < SLOTS_PER_DAY && row[t] > 0.5;
                if on {
                    run += 1;
                } else {
                    if run > 0 && run < window.min_runtime_slots {
                        penalty +=
                            SHORT_RUN_PENALTY * (window.min_runtime_slots - run) as f64;
                    }
                    run = 0;
                }
            }
        }
    }

    let cycle_depth = soc_high - soc_low;

    let weights = ctx.weights;
    let mut fitness = -(weights.cost * cost
        + weights.penalty * penalty
        + weights.cycles * cycle_depth
        + weights.peak * peak_import_kw);
    if !fitness.is_finite() {
        fitness = f64::NEG_INFINITY;
    }

    SimulationResult {
        energy_cost_eur: cost,
        grid_import_kwh: import_kwh,
        grid_export_kwh: export_kwh,
        battery_cycle_depth: cycle_depth,
        peak_import_kw,
        constraint_penalty: penalty,
        soc_clamps,
        fitness,
    }
}
