//! The control loop: refresh forecasts, optimize, publish, repeat.
//!
//! One scheduler value owns every piece of mutable state: the caches, the
//! published plan, and the retry/fingerprint bookkeeping. Ticks align to
//! wall-clock multiples of the cadence; a newer tick cancels an in-flight
//! run at its next generation boundary, and a cancelled run never
//! publishes.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ControllerConfig, SourceConfig};
use crate::domain::{BatterySpec, DeviceCommand, DeviceSpec, PublishedPlan, SlotSeries};
use crate::error::{Degraded, ErrorKind};
use crate::forecast::{
    fuse, price_series, synthesize, DiurnalTemplate, KeyedCache, PlausibilityEnvelope,
    TariffParams,
};
use crate::optimizer::{GaEngine, RunMetrics, Termination};
use crate::simulator::{FitnessWeights, SimulationContext};
use crate::sources::shapes::{classify_market, classify_pv};
use crate::sources::{
    fingerprint_json, fingerprint_of, Clock, HistorySource, PlanSink, TimeSeriesSource,
};
use crate::timegrid::TimeGrid;

/// One observability record per completed tick, appended as a JSON line
/// when a record path is configured.
#[derive(Debug, Clone, Serialize)]
pub struct TickRecord {
    pub tick_ts: DateTime<Utc>,
    pub best_fitness: Option<f64>,
    pub generations_run: usize,
    pub degraded_inputs: Vec<ErrorKind>,
    pub published_first_slot: Option<FirstSlotRecord>,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirstSlotRecord {
    pub devices: BTreeMap<String, DeviceCommand>,
    pub battery_kw: f64,
}

/// What one tick did.
#[derive(Debug)]
pub enum TickOutcome {
    Published(TickRecord),
    Skipped(TickRecord),
    Cancelled,
}

struct RefreshedInputs {
    pv: Degraded<SlotSeries>,
    load: Degraded<SlotSeries>,
    price: Degraded<SlotSeries>,
    fingerprints: (u64, u64, u64),
}

/// Inputs cloned out of the scheduler for the blocking optimizer task.
struct OwnedSimInputs {
    pv: SlotSeries,
    load: SlotSeries,
    price: SlotSeries,
    battery: BatterySpec,
    devices: Vec<DeviceSpec>,
    weights: FitnessWeights,
    export_price_eur_per_kwh: f64,
}

impl OwnedSimInputs {
    fn context(&self) -> SimulationContext<'_> {
        SimulationContext {
            pv: &self.pv,
            load: &self.load,
            price: &self.price,
            battery: &self.battery,
            devices: &self.devices,
            weights: self.weights,
            export_price_eur_per_kwh: self.export_price_eur_per_kwh,
        }
    }
}

pub struct Scheduler {
    tz: Tz,
    controller_cfg: ControllerConfig,
    source_cfg: SourceConfig,
    battery: BatterySpec,
    devices: Vec<DeviceSpec>,
    tariff: TariffParams,
    tariff_fingerprint: u64,
    weights: FitnessWeights,
    template: DiurnalTemplate,
    envelope: PlausibilityEnvelope,
    pv_ttl: Duration,
    load_ttl: Duration,
    engine: Arc<GaEngine>,

    source: Arc<dyn TimeSeriesSource>,
    history: Option<Arc<dyn HistorySource>>,
    sink: Arc<dyn PlanSink>,
    clock: Arc<dyn Clock>,

    pv_cache: KeyedCache<Degraded<SlotSeries>>,
    load_cache: KeyedCache<Degraded<SlotSeries>>,
    price_cache: KeyedCache<Degraded<SlotSeries>>,
    cache_day: Mutex<Option<NaiveDate>>,

    published: RwLock<Option<PublishedPlan>>,
    pending_retry: Mutex<Option<PublishedPlan>>,
    last_fingerprints: Mutex<Option<(u64, u64, u64)>>,
    record_path: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(
        cfg: &AppConfig,
        source: Arc<dyn TimeSeriesSource>,
        history: Option<Arc<dyn HistorySource>>,
        sink: Arc<dyn PlanSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let tz: Tz = cfg
            .timezone
            .parse()
            .map_err(|e| anyhow!("unknown timezone {:?}: {e}", cfg.timezone))?;

        let battery = cfg.battery.to_spec();
        battery.ensure_physical()?;

        let devices = cfg.device_specs()?;
        for device in &devices {
            if device.is_infeasible() {
                warn!(
                    device = %device.id,
                    required_kwh = device.window.as_ref().map(|w| w.required_energy_kwh),
                    ceiling_kwh = device.max_window_energy_kwh(),
                    "windowed energy requirement exceeds what the window can deliver"
                );
            }
        }

        let tariff = cfg.tariff.to_params();
        let tariff_fingerprint =
            fingerprint_of(serde_json::to_string(&tariff).unwrap_or_default().as_str());
        let engine = Arc::new(GaEngine::new(cfg.optimizer.to_params())?);

        Ok(Self {
            tz,
            controller_cfg: cfg.controller.clone(),
            source_cfg: cfg.source.clone(),
            battery,
            devices,
            tariff_fingerprint,
            weights: cfg.weights.to_weights(),
            template: cfg.forecast.template()?,
            envelope: cfg.forecast.envelope(),
            pv_ttl: Duration::from_secs(cfg.forecast.pv_ttl_secs),
            load_ttl: Duration::from_secs(cfg.forecast.load_ttl_secs),
            engine,
            source,
            history,
            sink,
            clock,
            pv_cache: KeyedCache::new(),
            load_cache: KeyedCache::new(),
            price_cache: KeyedCache::new(),
            cache_day: Mutex::new(None),
            published: RwLock::new(None),
            pending_retry: Mutex::new(None),
            last_fingerprints: Mutex::new(None),
            record_path: cfg.controller.record_path.clone(),
            tariff,
        })
    }

    /// Latest atomically published plan, if any.
    pub fn published_plan(&self) -> Option<PublishedPlan> {
        self.published.read().clone()
    }

    /// Drive the periodic loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let base_interval = self.controller_cfg.tick_minutes;
        let mut interval_minutes = base_interval;
        let mut consecutive_failures = 0u32;

        loop {
            let now = self.clock.now_utc();
            let wait = next_aligned_delay(now, interval_minutes);
            debug!(wait_s = wait.as_secs(), "sleeping until next tick");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let run_token = CancellationToken::new();
            let tick = self.run_tick(&run_token);
            tokio::pin!(tick);
            let next_tick_in = Duration::from_secs(u64::from(interval_minutes) * 60);

            tokio::select! {
                result = &mut tick => match result {
                    Ok(TickOutcome::Published(record)) => {
                        info!(
                            best_fitness = record.best_fitness,
                            generations = record.generations_run,
                            degraded = record.degraded_inputs.len(),
                            "tick published"
                        );
                        consecutive_failures = 0;
                        interval_minutes = base_interval;
                    }
                    Ok(TickOutcome::Skipped(_)) => {
                        consecutive_failures = 0;
                        interval_minutes = base_interval;
                    }
                    Ok(TickOutcome::Cancelled) => {}
                    Err(e) => {
                        warn!(error = %e, "tick failed");
                        consecutive_failures += 1;
                        if consecutive_failures >= 3 {
                            interval_minutes = (interval_minutes * 2)
                                .min(self.controller_cfg.max_backoff_minutes);
                            warn!(interval_minutes, "repeated failures, backing off");
                        }
                    }
                },
                _ = tokio::time::sleep(next_tick_in) => {
                    // A newer tick is due: cancel the stale run at its next
                    // generation boundary and discard whatever it returns.
                    run_token.cancel();
                    let _ = (&mut tick).await;
                    info!("in-flight run cancelled by newer tick");
                }
                _ = shutdown.cancelled() => {
                    run_token.cancel();
                    let _ = (&mut tick).await;
                    break;
                }
            }
        }
        info!("scheduler loop stopped");
        Ok(())
    }

    /// One full tick: refresh -> (maybe skip) -> optimize -> publish.
    pub async fn run_tick(&self, run_token: &CancellationToken) -> Result<TickOutcome> {
        let now = self.clock.now_utc();
        let grid = TimeGrid::for_now(now, self.tz);
        self.rollover_caches(grid.day()).await;

        // Single retry of a plan the sink rejected last tick. A successful
        // retry becomes the visible plan, same as the primary publish path.
        let retry = self.pending_retry.lock().take();
        if let Some(plan) = retry {
            match self.sink.publish_plan(&plan).await {
                Ok(()) => {
                    *self.published.write() = Some(plan);
                }
                Err(e) => {
                    warn!(error = %e, "plan republish failed, dropping");
                }
            }
        }

        let inputs = self.refresh_inputs(&grid, now).await;
        let mut tags: Vec<ErrorKind> = Vec::new();
        for tag in inputs
            .pv
            .tags
            .iter()
            .chain(&inputs.load.tags)
            .chain(&inputs.price.tags)
        {
            if !tags.contains(tag) {
                tags.push(*tag);
            }
        }
        if self.devices.iter().any(DeviceSpec::is_infeasible) {
            tags.push(ErrorKind::ConstraintInfeasible);
        }

        let unchanged = *self.last_fingerprints.lock() == Some(inputs.fingerprints);
        if !tags.is_empty() && unchanged && self.published.read().is_some() {
            info!("degraded inputs unchanged since last tick, reusing previous plan");
            let record = TickRecord {
                tick_ts: now,
                best_fitness: None,
                generations_run: 0,
                degraded_inputs: tags,
                published_first_slot: None,
                skipped: true,
            };
            self.write_record(&record).await;
            return Ok(TickOutcome::Skipped(record));
        }
        *self.last_fingerprints.lock() = Some(inputs.fingerprints);

        let (best, metrics) = self.optimize(inputs, run_token.clone()).await?;
        if metrics.termination == Termination::Cancelled {
            return Ok(TickOutcome::Cancelled);
        }

        let commit_slot = grid.slot_of(now).unwrap_or(0);
        let published =
            PublishedPlan::from_plan(best.into_plan(), &self.devices, commit_slot, now);
        let first_slot = FirstSlotRecord {
            devices: published.devices.clone(),
            battery_kw: published.battery_kw,
        };

        match self.sink.publish_plan(&published).await {
            Ok(()) => {
                *self.published.write() = Some(published);
            }
            Err(e) => {
                // The previous plan stays visible; retry once next tick.
                warn!(error = %e, "plan publication failed, will retry next tick");
                *self.pending_retry.lock() = Some(published);
            }
        }

        let record = TickRecord {
            tick_ts: now,
            best_fitness: Some(metrics.best_fitness),
            generations_run: metrics.generations_run,
            degraded_inputs: tags,
            published_first_slot: Some(first_slot),
            skipped: false,
        };
        self.write_record(&record).await;
        Ok(TickOutcome::Published(record))
    }

    async fn optimize(
        &self,
        inputs: RefreshedInputs,
        token: CancellationToken,
    ) -> Result<(crate::optimizer::Candidate, RunMetrics)> {
        let owned = OwnedSimInputs {
            pv: inputs.pv.value,
            load: inputs.load.value,
            price: inputs.price.value,
            battery: self.battery.clone(),
            devices: self.devices.clone(),
            weights: self.weights,
            export_price_eur_per_kwh: self.tariff.export_price_eur_per_kwh,
        };
        let engine = Arc::clone(&self.engine);
        let budget = Duration::from_secs(self.controller_cfg.tick_budget_s);
        tokio::task::spawn_blocking(move || {
            let ctx = owned.context();
            engine.optimize(&ctx, budget, &token)
        })
        .await
        .context("optimizer task panicked")
    }

    async fn refresh_inputs(&self, grid: &TimeGrid, now: DateTime<Utc>) -> RefreshedInputs {
        let (today_attrs, fp_today) =
            self.read_attributes(&self.source_cfg.pv_today_entity).await;
        let (tomorrow_attrs, fp_tomorrow) =
            self.read_attributes(&self.source_cfg.pv_tomorrow_entity).await;
        let (market_attrs, fp_market) =
            self.read_attributes(&self.source_cfg.market_entity).await;

        let fp_pv = fingerprint_of(&(fp_today, fp_tomorrow));
        let pv_key = fingerprint_of(&(fp_pv, grid.day()));
        let grid_copy = *grid;
        let pv = self
            .pv_cache
            .get_or_build(pv_key, self.pv_ttl, move || async move {
                let (today_shape, mut tags) = classify_pv(&today_attrs);
                let (tomorrow_shape, more) = classify_pv(&tomorrow_attrs);
                tags.extend(more);
                let mut fused = fuse(
                    &today_shape.into_samples(),
                    &tomorrow_shape.into_samples(),
                    &grid_copy,
                );
                for tag in tags {
                    fused.push(tag);
                }
                fused
            })
            .await;

        // Price cache holds until the next full hour or a source change.
        let price_key = fingerprint_of(&(grid.day(), fp_market, self.tariff_fingerprint));
        let price_ttl = seconds_to_next_hour(now);
        let tariff = self.tariff.clone();
        let price = self
            .price_cache
            .get_or_build(price_key, price_ttl, move || async move {
                let (shape, tags) = classify_market(&market_attrs);
                let mut result = price_series(&shape, &tariff, &grid_copy);
                for tag in tags {
                    result.push(tag);
                }
                result
            })
            .await;

        // The load key covers the rolling history window: entity plus day;
        // the TTL bounds staleness inside the day.
        let load_entity = self.source_cfg.load_entity.clone();
        let fp_load = fingerprint_of(&(grid.day(), load_entity.as_deref().unwrap_or("")));
        let load = self
            .load_cache
            .get_or_build(fp_load, self.load_ttl, || async {
                synthesize(
                    self.history.as_deref(),
                    load_entity.as_deref(),
                    grid,
                    &self.template,
                    self.envelope,
                    &*self.clock,
                )
                .await
            })
            .await;

        RefreshedInputs { pv, load, price, fingerprints: (fp_pv, fp_market, fp_load) }
    }

    async fn read_attributes(&self, entity_id: &str) -> (Value, u64) {
        match self.source.read_series(entity_id).await {
            Ok(state) => {
                let fp = fingerprint_json(&state.attributes);
                (state.attributes, fp)
            }
            Err(e) => {
                warn!(error = %e, entity_id, "time-series read failed");
                (Value::Null, 0)
            }
        }
    }

    /// Day rollover: every cache key embeds the grid day, so yesterday's
    /// entries can never hit again; purge them instead of accumulating.
    async fn rollover_caches(&self, day: NaiveDate) {
        let changed = {
            let mut guard = self.cache_day.lock();
            if *guard == Some(day) {
                false
            } else {
                *guard = Some(day);
                true
            }
        };
        if changed {
            self.pv_cache.purge().await;
            self.price_cache.purge().await;
            self.load_cache.purge().await;
        }
    }

    async fn write_record(&self, record: &TickRecord) {
        let Some(path) = &self.record_path else { return };
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "tick record serialization failed");
                return;
            }
        };
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "tick record write failed");
        }
    }
}

/// Delay until the next wall-clock multiple of the interval.
fn next_aligned_delay(now: DateTime<Utc>, interval_minutes: u32) -> Duration {
    let interval = i64::from(interval_minutes) * 60;
    let secs = now.timestamp();
    let next = (secs.div_euclid(interval) + 1) * interval;
    Duration::from_secs((next - secs).max(1) as u64)
}

fn seconds_to_next_hour(now: DateTime<Utc>) -> Duration {
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs(3600 - into_hour.min(3599))
}
