//! End-to-end scenarios: simulator arithmetic, optimizer behavior, and the
//! controller's publish/skip/cancel paths, all on in-memory ports.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use common::{
    base_config, market_attrs, pv_attrs_daytime, FixedClock, RecordingSink, StaticSource,
    test_now,
};
use gridplan::controller::{Scheduler, TickOutcome};
use gridplan::domain::{BatterySpec, DeviceControl, DeviceSpec, DeviceWindow, SlotSeries};
use gridplan::error::ErrorKind;
use gridplan::optimizer::{GaEngine, GaParams, Termination};
use gridplan::simulator::{simulate, simulate_traced, FitnessWeights, SimulationContext};
use gridplan::timegrid::SLOTS_PER_DAY;

fn engine(seed: u64) -> GaEngine {
    GaEngine::new(GaParams {
        population_size: 80,
        generations_max: 150,
        stall_gens: 40,
        seed: Some(seed),
        workers: 2,
        ..GaParams::default()
    })
    .unwrap()
}

fn sim_ctx<'a>(
    pv: &'a SlotSeries,
    load: &'a SlotSeries,
    price: &'a SlotSeries,
    battery: &'a BatterySpec,
    devices: &'a [DeviceSpec],
) -> SimulationContext<'a> {
    SimulationContext {
        pv,
        load,
        price,
        battery,
        devices,
        weights: FitnessWeights::default(),
        export_price_eur_per_kwh: 0.0,
    }
}

fn scheduler_with(source: StaticSource, sink: Arc<RecordingSink>) -> Arc<Scheduler> {
    Arc::new(
        Scheduler::new(
            &base_config(),
            Arc::new(source),
            None,
            sink,
            Arc::new(FixedClock(test_now())),
        )
        .unwrap(),
    )
}

fn full_source() -> StaticSource {
    StaticSource::new()
        .with("sensor.pv_forecast_today", pv_attrs_daytime(3.0))
        .with("sensor.pv_forecast_tomorrow", pv_attrs_daytime(2.5))
        .with("sensor.market_price", market_attrs(50.0))
}

// S1: no PV, flat 1 kW load, flat 0.20 EUR/kWh, no battery.
#[test]
fn s1_flat_day_costs_4_80() {
    let pv = SlotSeries::zeros();
    let load = SlotSeries::filled(1.0);
    let price = SlotSeries::filled(0.20);
    let battery = BatterySpec::none();
    let ctx = sim_ctx(&pv, &load, &price, &battery, &[]);
    let result = simulate(&[], &vec![0.0; SLOTS_PER_DAY], &ctx);
    assert!((result.grid_import_kwh - 24.0).abs() < 1e-9);
    assert!((result.energy_cost_eur - 4.80).abs() < 1e-9);
}

// S2: midday PV excess, evening load; the optimizer should use the
// battery to cut grid import below the no-battery baseline.
#[test]
fn s2_battery_stores_pv_excess() {
    let mut pv = SlotSeries::zeros();
    for slot in 32..64 {
        pv.set(slot, 3.0);
    }
    let load = SlotSeries::filled(0.5);
    let price = SlotSeries::filled(0.30);
    let battery = BatterySpec {
        capacity_kwh: 10.0,
        max_charge_kw: 2.0,
        max_discharge_kw: 2.0,
        round_trip_eff: 0.95,
        soc_min: 0.05,
        soc_max: 0.95,
        initial_soc: 0.05,
    };
    let ctx = sim_ctx(&pv, &load, &price, &battery, &[]);

    let baseline = simulate(&[], &vec![0.0; SLOTS_PER_DAY], &ctx);
    let (best, metrics) =
        engine(42).optimize(&ctx, Duration::from_secs(60), &CancellationToken::new());
    assert!(metrics.best_fitness > baseline.fitness, "optimizer must beat idle battery");

    let (result, trace) = simulate_traced(&best.device_activity, &best.battery_kw, &ctx);
    assert!(result.grid_import_kwh < baseline.grid_import_kwh);

    // Daytime excess flows into the battery.
    let midday_charge: f64 = trace[32..64].iter().map(|s| s.battery_kw.max(0.0)).sum();
    assert!(midday_charge > 0.0);

    // P4: per-slot energy balance on the optimized plan.
    for (t, step) in trace.iter().enumerate() {
        let balance = pv[t] - load[t] - step.device_load_kw - step.battery_kw
            - (step.grid_export_kw - step.grid_import_kw);
        assert!(balance.abs() < 1e-9, "slot {t}: residual {balance}");
    }
}

// S3: peak tariff 18:00-21:00; a windowed 2 kWh device in 16:00-23:00
// should deliver its energy mostly outside the peak slots.
#[test]
fn s3_device_avoids_peak_tariff() {
    let pv = SlotSeries::zeros();
    let load = SlotSeries::zeros();
    let mut price = SlotSeries::filled(0.10);
    for slot in 72..84 {
        price.set(slot, 0.40);
    }
    let battery = BatterySpec::none();
    let devices = vec![DeviceSpec {
        id: "heater".into(),
        power_kw: 1.0,
        priority: 1.0,
        control: DeviceControl::Binary,
        window: Some(DeviceWindow {
            earliest_slot: 64,
            latest_slot: 92,
            min_runtime_slots: 2,
            required_energy_kwh: 2.0,
        }),
    }];
    let ctx = sim_ctx(&pv, &load, &price, &battery, &devices);

    let (best, _) = engine(7).optimize(&ctx, Duration::from_secs(60), &CancellationToken::new());
    let row = &best.device_activity[..SLOTS_PER_DAY];

    let total_kwh: f64 = row[64..92].iter().map(|a| a * 0.25).sum();
    assert!(total_kwh >= 2.0 - 1e-9, "required energy not met: {total_kwh} kWh");

    let peak_kwh: f64 = row[72..84].iter().map(|a| a * 0.25).sum();
    assert!(peak_kwh <= 0.5, "too much energy in peak slots: {peak_kwh} kWh");
}

// S4: constant fitness landscape must stall out early.
#[test]
fn s4_stall_terminates_before_generation_cap() {
    let pv = SlotSeries::zeros();
    let load = SlotSeries::filled(1.0);
    let price = SlotSeries::filled(0.20);
    let battery = BatterySpec::none();
    let ctx = sim_ctx(&pv, &load, &price, &battery, &[]);

    let ga = GaEngine::new(GaParams {
        population_size: 20,
        generations_max: 200,
        stall_gens: 5,
        seed: Some(9),
        workers: 1,
        ..GaParams::default()
    })
    .unwrap();
    let (_, metrics) = ga.optimize(&ctx, Duration::from_secs(60), &CancellationToken::new());
    assert_eq!(metrics.termination, Termination::Stalled);
    assert!(metrics.generations_run < 200);
    let tail = &metrics.history[metrics.history.len() - 5..];
    assert!(tail.iter().all(|s| s.best == metrics.best_fitness));
}

// S5a: cancelling a long-budget run stops it at a generation boundary.
#[test]
fn s5_cancellation_stops_long_run() {
    let pv = SlotSeries::zeros();
    let load = SlotSeries::filled(1.0);
    let price = SlotSeries::filled(0.20);
    let battery = BatterySpec {
        capacity_kwh: 10.0,
        max_charge_kw: 2.0,
        max_discharge_kw: 2.0,
        round_trip_eff: 0.95,
        soc_min: 0.1,
        soc_max: 0.9,
        initial_soc: 0.5,
    };
    let ctx = sim_ctx(&pv, &load, &price, &battery, &[]);

    let ga = GaEngine::new(GaParams {
        population_size: 150,
        generations_max: 10_000_000,
        stall_gens: 10_000_000,
        seed: Some(3),
        workers: 2,
        ..GaParams::default()
    })
    .unwrap();
    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            token.cancel();
        })
    };
    let started = Instant::now();
    let (_, metrics) = ga.optimize(&ctx, Duration::from_secs(60), &token);
    canceller.join().unwrap();
    assert_eq!(metrics.termination, Termination::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(20));
}

// S5b: a cancelled tick never publishes.
#[tokio::test]
async fn s5_cancelled_tick_does_not_publish() {
    let sink = Arc::new(RecordingSink::new());
    let scheduler = scheduler_with(full_source(), Arc::clone(&sink));
    let token = CancellationToken::new();
    token.cancel();
    let outcome = scheduler.run_tick(&token).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Cancelled));
    assert_eq!(sink.count(), 0);
    assert!(scheduler.published_plan().is_none());
}

// S6: identical inputs and seed publish identical plans.
#[tokio::test]
async fn s6_ticks_are_deterministic() {
    let sink_a = Arc::new(RecordingSink::new());
    let sink_b = Arc::new(RecordingSink::new());
    let scheduler_a = scheduler_with(full_source(), Arc::clone(&sink_a));
    let scheduler_b = scheduler_with(full_source(), Arc::clone(&sink_b));

    let token = CancellationToken::new();
    scheduler_a.run_tick(&token).await.unwrap();
    scheduler_b.run_tick(&token).await.unwrap();

    let plan_a = sink_a.last().unwrap();
    let plan_b = sink_b.last().unwrap();
    assert_eq!(plan_a.horizon, plan_b.horizon);
    assert_eq!(plan_a.devices, plan_b.devices);
    assert_eq!(plan_a.battery_kw, plan_b.battery_kw);
    assert_eq!(plan_a.commit_slot, plan_b.commit_slot);
}

// B1/B2: missing inputs surface as degradation tags on the tick record,
// and the tick still publishes a plan.
#[tokio::test]
async fn degraded_inputs_still_publish_with_tags() {
    let sink = Arc::new(RecordingSink::new());
    // Only the market entity resolves; PV reads fail outright.
    let source = StaticSource::new().with("sensor.market_price", serde_json::json!({}));
    let scheduler = scheduler_with(source, Arc::clone(&sink));

    let outcome = scheduler.run_tick(&CancellationToken::new()).await.unwrap();
    let TickOutcome::Published(record) = outcome else {
        panic!("expected a published tick");
    };
    assert!(record.degraded_inputs.contains(&ErrorKind::NoPvData));
    assert!(record.degraded_inputs.contains(&ErrorKind::NoMarketPrice));
    assert!(record.degraded_inputs.contains(&ErrorKind::HistoryUnavailable));
    assert_eq!(sink.count(), 1);
}

// Degraded and unchanged inputs skip re-optimization on the next tick.
#[tokio::test]
async fn unchanged_degraded_inputs_skip_second_tick() {
    let sink = Arc::new(RecordingSink::new());
    let source = StaticSource::new().with("sensor.market_price", serde_json::json!({}));
    let scheduler = scheduler_with(source, Arc::clone(&sink));
    let token = CancellationToken::new();

    let first = scheduler.run_tick(&token).await.unwrap();
    assert!(matches!(first, TickOutcome::Published(_)));
    let second = scheduler.run_tick(&token).await.unwrap();
    let TickOutcome::Skipped(record) = second else {
        panic!("expected the second tick to skip");
    };
    assert!(record.skipped);
    assert_eq!(sink.count(), 1, "skipped tick must not republish");
}

// B5: an unsatisfiable windowed requirement is penalized and the best
// plan maximizes runtime inside the window.
#[test]
fn b5_infeasible_window_maximizes_runtime() {
    let pv = SlotSeries::zeros();
    let load = SlotSeries::zeros();
    let price = SlotSeries::filled(0.10);
    let battery = BatterySpec::none();
    let devices = vec![DeviceSpec {
        id: "heater".into(),
        power_kw: 1.0,
        priority: 1.0,
        control: DeviceControl::Binary,
        window: Some(DeviceWindow {
            earliest_slot: 40,
            latest_slot: 44,
            min_runtime_slots: 1,
            // 4 slots at 1 kW can deliver only 1 kWh.
            required_energy_kwh: 2.0,
        }),
    }];
    let ctx = sim_ctx(&pv, &load, &price, &battery, &devices);

    let (best, _) = engine(5).optimize(&ctx, Duration::from_secs(60), &CancellationToken::new());
    let result = simulate(&best.device_activity, &best.battery_kw, &ctx);
    assert!(result.constraint_penalty > 0.0);
    for slot in 40..44 {
        assert_eq!(best.device_activity[slot], 1.0, "slot {slot} should run");
    }
}

// P1: published horizon always spans the full 96-slot day.
#[tokio::test]
async fn published_horizon_is_full_length() {
    let sink = Arc::new(RecordingSink::new());
    let scheduler = scheduler_with(full_source(), Arc::clone(&sink));
    scheduler.run_tick(&CancellationToken::new()).await.unwrap();
    let plan = sink.last().unwrap();
    assert_eq!(plan.horizon.battery_kw.len(), SLOTS_PER_DAY);
    assert!(plan.horizon.device_activity.is_empty()); // no devices configured
    assert_eq!(plan.commit_slot, 48); // noon UTC
}

// Scheduler whose inputs carry no degradation tags (clean load history),
// so every tick re-optimizes instead of skipping.
fn scheduler_with_clean_history(sink: Arc<RecordingSink>) -> Arc<Scheduler> {
    use gridplan::sources::HistorySample;

    let mut cfg = base_config();
    cfg.source.load_entity = Some("sensor.house_consumption".to_string());
    let history = common::StaticHistory(vec![HistorySample {
        timestamp: test_now() - chrono::Duration::hours(2),
        state: "0.6".into(),
    }]);
    Arc::new(
        Scheduler::new(
            &cfg,
            Arc::new(full_source()),
            Some(Arc::new(history)),
            sink as Arc<dyn gridplan::sources::PlanSink>,
            Arc::new(FixedClock(test_now())),
        )
        .unwrap(),
    )
}

// A rejected publication is retried exactly once on the next tick.
#[tokio::test]
async fn failed_publication_retries_next_tick() {
    let sink = Arc::new(RecordingSink::new());
    let scheduler = scheduler_with_clean_history(Arc::clone(&sink));
    let token = CancellationToken::new();

    sink.fail_on_call(0);
    let first = scheduler.run_tick(&token).await.unwrap();
    assert!(matches!(first, TickOutcome::Published(_)));
    assert_eq!(sink.count(), 0);
    assert!(scheduler.published_plan().is_none(), "failed publish must not become visible");

    let _ = scheduler.run_tick(&token).await.unwrap();
    // The retried plan and the new tick's plan both land.
    assert_eq!(sink.count(), 2);
    assert!(scheduler.published_plan().is_some());
}

// A successful retry becomes the visible plan, and it stays visible even
// when the same tick's fresh publication fails afterwards.
#[tokio::test]
async fn successful_retry_becomes_visible_plan() {
    let sink = Arc::new(RecordingSink::new());
    let scheduler = scheduler_with_clean_history(Arc::clone(&sink));
    let token = CancellationToken::new();

    // Call 0: tick 1's fresh publish fails. Call 1: tick 2's retry
    // succeeds. Call 2: tick 2's fresh publish fails again.
    sink.fail_on_call(0);
    sink.fail_on_call(2);

    scheduler.run_tick(&token).await.unwrap();
    assert_eq!(sink.count(), 0);
    assert!(scheduler.published_plan().is_none());

    scheduler.run_tick(&token).await.unwrap();
    assert_eq!(sink.count(), 1, "only the retried plan reached the sink");
    let visible = scheduler.published_plan().expect("retried plan must be visible");
    assert_eq!(visible.id, sink.last().unwrap().id);
}

// R2: publishing the same plan twice is idempotent at the sink level.
#[tokio::test]
async fn republishing_same_plan_is_idempotent() {
    let sink = Arc::new(RecordingSink::new());
    let scheduler = scheduler_with(full_source(), Arc::clone(&sink));
    scheduler.run_tick(&CancellationToken::new()).await.unwrap();
    let plan = sink.last().unwrap();

    use gridplan::sources::PlanSink;
    sink.publish_plan(&plan).await.unwrap();
    let again = sink.last().unwrap();
    assert_eq!(plan, again);
}

// Tick records land in the configured JSON-lines file.
#[tokio::test]
async fn tick_records_are_appended_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ticks.jsonl");
    let mut cfg = base_config();
    cfg.controller.record_path = Some(path.clone());

    let sink = Arc::new(RecordingSink::new());
    let scheduler = Arc::new(
        Scheduler::new(
            &cfg,
            Arc::new(full_source()),
            None,
            Arc::clone(&sink) as Arc<dyn gridplan::sources::PlanSink>,
            Arc::new(FixedClock(test_now())),
        )
        .unwrap(),
    );
    scheduler.run_tick(&CancellationToken::new()).await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert!(record["best_fitness"].is_number());
    assert_eq!(record["skipped"], serde_json::json!(false));
}
