use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::domain::{BatterySpec, DeviceControl, DeviceSpec, DeviceWindow};
use crate::forecast::{DiurnalTemplate, PlausibilityEnvelope, TariffParams};
use crate::optimizer::{default_workers, GaParams};
use crate::simulator::FitnessWeights;
use crate::timegrid::{SLOTS_PER_DAY, SLOT_MINUTES};

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    /// IANA timezone the 96-slot day is anchored to.
    pub timezone: String,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    pub controller: ControllerConfig,

    #[validate(nested)]
    pub source: SourceConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,

    #[validate(nested)]
    pub optimizer: OptimizerConfig,

    pub tariff: TariffConfig,

    pub weights: WeightsConfig,

    #[validate(nested)]
    pub forecast: ForecastConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            telemetry: TelemetryConfig::default(),
            controller: ControllerConfig::default(),
            source: SourceConfig::default(),
            battery: BatteryConfig::default(),
            devices: Vec::new(),
            optimizer: OptimizerConfig::default(),
            tariff: TariffConfig::default(),
            weights: WeightsConfig::default(),
            forecast: ForecastConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_json: false }
    }
}

/// Control-loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_controller_config"))]
pub struct ControllerConfig {
    /// Control cadence; ticks align to wall-clock multiples.
    pub tick_minutes: u32,

    /// Wall-clock budget for one optimization run, seconds.
    #[validate(range(min = 1))]
    pub tick_budget_s: u64,

    /// Backoff ceiling when ticks keep failing.
    #[validate(range(min = 1, max = 1440))]
    pub max_backoff_minutes: u32,

    /// Optional JSON-lines file receiving one observability record per
    /// completed tick.
    pub record_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_minutes: 15,
            tick_budget_s: 10,
            max_backoff_minutes: 60,
            record_path: None,
        }
    }
}

fn validate_controller_config(config: &ControllerConfig) -> Result<(), validator::ValidationError> {
    if ![5, 15, 30, 60].contains(&config.tick_minutes) {
        return Err(validator::ValidationError::new(
            "tick_minutes must be one of 5, 15, 30, 60",
        ));
    }
    Ok(())
}

/// Host-platform endpoints and entity ids
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the host platform's REST API. Without it the scheduler
    /// cannot read forecasts and refuses to start.
    pub base_url: Option<String>,

    pub token: Option<String>,

    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,

    pub pv_today_entity: String,
    pub pv_tomorrow_entity: String,
    pub market_entity: String,

    /// Consumption sensor backing the load history; absent means the
    /// diurnal template is the only load source.
    pub load_entity: Option<String>,

    /// Actuator webhook receiving the committed plan; absent means the
    /// plan is only logged.
    pub actuator_url: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout_secs: 10,
            pv_today_entity: "sensor.pv_forecast_today".to_string(),
            pv_tomorrow_entity: "sensor.pv_forecast_tomorrow".to_string(),
            market_entity: "sensor.market_price".to_string(),
            load_entity: None,
            actuator_url: None,
        }
    }
}

/// Battery configuration, SOC values as fractions of capacity
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_battery_config"))]
pub struct BatteryConfig {
    #[validate(range(min = 0.0, max = 1000.0))]
    pub capacity_kwh: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub max_charge_kw: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub max_discharge_kw: f64,

    #[validate(range(min = 0.05, max = 1.0))]
    pub round_trip_eff: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub soc_min: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub soc_max: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub initial_soc: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 10.0,
            max_charge_kw: 2.5,
            max_discharge_kw: 2.5,
            round_trip_eff: 0.95,
            soc_min: 0.1,
            soc_max: 0.95,
            initial_soc: 0.5,
        }
    }
}

fn validate_battery_config(config: &BatteryConfig) -> Result<(), validator::ValidationError> {
    if config.soc_min >= config.soc_max {
        return Err(validator::ValidationError::new("soc_min must be less than soc_max"));
    }
    if config.initial_soc < config.soc_min || config.initial_soc > config.soc_max {
        return Err(validator::ValidationError::new(
            "initial_soc must be between soc_min and soc_max",
        ));
    }
    Ok(())
}

impl BatteryConfig {
    pub fn to_spec(&self) -> BatterySpec {
        BatterySpec {
            capacity_kwh: self.capacity_kwh,
            max_charge_kw: self.max_charge_kw,
            max_discharge_kw: self.max_discharge_kw,
            round_trip_eff: self.round_trip_eff,
            soc_min: self.soc_min,
            soc_max: self.soc_max,
            initial_soc: self.initial_soc,
        }
    }
}

/// Scheduling window for one device, wall-clock bounds as `HH:MM`
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DeviceWindowConfig {
    pub earliest: String,
    pub latest: String,

    #[serde(default)]
    pub min_runtime_minutes: u32,

    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub required_energy_kwh: f64,
}

/// One controllable device
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DeviceConfig {
    #[validate(length(min = 1))]
    pub id: String,

    #[validate(range(min = 0.0, max = 100.0))]
    pub power_kw: f64,

    #[serde(default = "default_priority")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub priority: f64,

    #[serde(default = "default_control")]
    pub control: DeviceControl,

    #[serde(default)]
    #[validate(nested)]
    pub window: Option<DeviceWindowConfig>,
}

impl DeviceConfig {
    pub fn to_spec(&self) -> Result<DeviceSpec> {
        let window = match &self.window {
            None => None,
            Some(w) => {
                let earliest_slot = parse_hhmm_slot(&w.earliest)
                    .with_context(|| format!("device {}: bad earliest time", self.id))?;
                let latest_slot = parse_hhmm_slot_end(&w.latest)
                    .with_context(|| format!("device {}: bad latest time", self.id))?;
                if earliest_slot >= latest_slot {
                    anyhow::bail!(
                        "device {}: window [{}, {}) is empty",
                        self.id,
                        w.earliest,
                        w.latest
                    );
                }
                Some(DeviceWindow {
                    earliest_slot,
                    latest_slot,
                    min_runtime_slots: (w.min_runtime_minutes / SLOT_MINUTES) as usize,
                    required_energy_kwh: w.required_energy_kwh,
                })
            }
        };
        Ok(DeviceSpec {
            id: self.id.clone(),
            power_kw: self.power_kw,
            priority: self.priority,
            control: self.control,
            window,
        })
    }
}

/// Genetic-optimizer configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct OptimizerConfig {
    #[validate(range(min = 10))]
    pub population_size: usize,

    #[validate(range(min = 10))]
    pub generations_max: usize,

    #[validate(range(min = 0.0, max = 1.0))]
    pub p_cx: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub p_mut: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub elite_frac: f64,

    #[validate(range(min = 1))]
    pub stall_gens: usize,

    #[validate(range(min = 2, max = 16))]
    pub tournament_k: usize,

    pub seed: Option<u64>,

    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let p = GaParams::default();
        Self {
            population_size: p.population_size,
            generations_max: p.generations_max,
            p_cx: p.p_cx,
            p_mut: p.p_mut,
            elite_frac: p.elite_frac,
            stall_gens: p.stall_gens,
            tournament_k: p.tournament_k,
            seed: None,
            workers: default_workers(),
        }
    }
}

impl OptimizerConfig {
    pub fn to_params(&self) -> GaParams {
        GaParams {
            population_size: self.population_size,
            generations_max: self.generations_max,
            p_cx: self.p_cx,
            p_mut: self.p_mut,
            elite_frac: self.elite_frac,
            stall_gens: self.stall_gens,
            tournament_k: self.tournament_k,
            epsilon_improve: GaParams::default().epsilon_improve,
            seed: self.seed,
            workers: self.workers,
        }
    }
}

/// Indexed-tariff components; mirrors [`TariffParams`]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TariffConfig {
    pub fp: f64,
    pub q: f64,
    pub tae: f64,
    pub mfrr: f64,
    pub vat: f64,
    pub peak_hours: Vec<u8>,
    pub shoulder_hours: Vec<u8>,
    pub peak_factor: f64,
    pub shoulder_factor: f64,
    pub offpeak_factor: f64,
    pub summer_months: Vec<u8>,
    pub summer_factor: f64,
    pub winter_factor: f64,
    pub fallback_eur_per_mwh: f64,
    pub export_price_eur_per_kwh: f64,
}

impl Default for TariffConfig {
    fn default() -> Self {
        let p = TariffParams::default();
        Self {
            fp: p.fp,
            q: p.q,
            tae: p.tae,
            mfrr: p.mfrr,
            vat: p.vat,
            peak_hours: p.peak_hours,
            shoulder_hours: p.shoulder_hours,
            peak_factor: p.peak_factor,
            shoulder_factor: p.shoulder_factor,
            offpeak_factor: p.offpeak_factor,
            summer_months: p.summer_months,
            summer_factor: p.summer_factor,
            winter_factor: p.winter_factor,
            fallback_eur_per_mwh: p.fallback_eur_per_mwh,
            export_price_eur_per_kwh: p.export_price_eur_per_kwh,
        }
    }
}

impl TariffConfig {
    pub fn to_params(&self) -> TariffParams {
        TariffParams {
            fp: self.fp,
            q: self.q,
            tae: self.tae,
            mfrr: self.mfrr,
            vat: self.vat,
            peak_hours: self.peak_hours.clone(),
            shoulder_hours: self.shoulder_hours.clone(),
            peak_factor: self.peak_factor,
            shoulder_factor: self.shoulder_factor,
            offpeak_factor: self.offpeak_factor,
            summer_months: self.summer_months.clone(),
            summer_factor: self.summer_factor,
            winter_factor: self.winter_factor,
            fallback_eur_per_mwh: self.fallback_eur_per_mwh,
            export_price_eur_per_kwh: self.export_price_eur_per_kwh,
        }
    }
}

/// Fitness weights
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub cost: f64,
    pub penalty: f64,
    pub cycles: f64,
    pub peak: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        let w = FitnessWeights::default();
        Self { cost: w.cost, penalty: w.penalty, cycles: w.cycles, peak: w.peak }
    }
}

impl WeightsConfig {
    pub fn to_weights(&self) -> FitnessWeights {
        FitnessWeights {
            cost: self.cost,
            penalty: self.penalty,
            cycles: self.cycles,
            peak: self.peak,
        }
    }
}

/// One diurnal-template breakpoint, time as `HH:MM`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplatePointConfig {
    pub time: String,
    pub kw: f64,
}

/// Forecast caching and load-synthesis configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ForecastConfig {
    #[validate(range(min = 1))]
    pub pv_ttl_secs: u64,

    #[validate(range(min = 1))]
    pub load_ttl_secs: u64,

    #[validate(range(min = 0.0))]
    pub envelope_min_kw: f64,

    #[validate(range(min = 0.0))]
    pub envelope_max_kw: f64,

    /// Diurnal-template breakpoints; `None` uses the built-in curve.
    pub template: Option<Vec<TemplatePointConfig>>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        let envelope = PlausibilityEnvelope::default();
        Self {
            pv_ttl_secs: 300,
            load_ttl_secs: 900,
            envelope_min_kw: envelope.min_mean_kw,
            envelope_max_kw: envelope.max_mean_kw,
            template: None,
        }
    }
}

impl ForecastConfig {
    pub fn envelope(&self) -> PlausibilityEnvelope {
        PlausibilityEnvelope {
            min_mean_kw: self.envelope_min_kw,
            max_mean_kw: self.envelope_max_kw,
        }
    }

    pub fn template(&self) -> Result<DiurnalTemplate> {
        match &self.template {
            None => Ok(DiurnalTemplate::default()),
            Some(points) => {
                let mut breakpoints = Vec::with_capacity(points.len());
                for point in points {
                    let minutes = parse_hhmm(&point.time)
                        .with_context(|| format!("bad template time {:?}", point.time))?;
                    breakpoints.push((minutes, point.kw.max(0.0)));
                }
                breakpoints.sort_by_key(|(m, _)| *m);
                Ok(DiurnalTemplate { breakpoints })
            }
        }
    }
}

fn default_timezone() -> String {
    "Europe/Lisbon".to_string()
}

fn default_priority() -> f64 {
    0.5
}

fn default_control() -> DeviceControl {
    DeviceControl::Binary
}

/// Parse `HH:MM` into minutes since midnight.
fn parse_hhmm(value: &str) -> Result<u32> {
    let (hh, mm) = value
        .split_once(':')
        .with_context(|| format!("expected HH:MM, got {value:?}"))?;
    let hours: u32 = hh.parse().with_context(|| format!("bad hour in {value:?}"))?;
    let minutes: u32 = mm.parse().with_context(|| format!("bad minute in {value:?}"))?;
    if hours >= 24 || minutes >= 60 {
        anyhow::bail!("time {value:?} out of range");
    }
    Ok(hours * 60 + minutes)
}

fn parse_hhmm_slot(value: &str) -> Result<usize> {
    Ok((parse_hhmm(value)? / SLOT_MINUTES) as usize)
}

/// End-of-window parse: `"00:00"` and `"24:00"` both mean end of day.
fn parse_hhmm_slot_end(value: &str) -> Result<usize> {
    if value == "24:00" {
        return Ok(SLOTS_PER_DAY);
    }
    let minutes = parse_hhmm(value)?;
    if minutes == 0 {
        return Ok(SLOTS_PER_DAY);
    }
    Ok((minutes / SLOT_MINUTES) as usize)
}

impl AppConfig {
    /// Load configuration from `config/default.toml` overridden by
    /// environment variables with the `GRIDPLAN__` prefix
    /// (`GRIDPLAN__CONTROLLER__TICK_MINUTES` -> `controller.tick_minutes`).
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GRIDPLAN__").split("__"))
            .extract()
            .context("Failed to parse configuration")?;

        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    pub fn device_specs(&self) -> Result<Vec<DeviceSpec>> {
        self.devices.iter().map(DeviceConfig::to_spec).collect()
    }
}
