use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Battery plant parameters, immutable after startup.
///
/// SOC values are fractions of capacity in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySpec {
    pub capacity_kwh: f64,
    pub max_charge_kw: f64,
    pub max_discharge_kw: f64,
    pub round_trip_eff: f64,
    pub soc_min: f64,
    pub soc_max: f64,
    pub initial_soc: f64,
}

impl BatterySpec {
    /// A zero-capacity battery: dispatch commands clamp to 0.
    pub fn none() -> Self {
        Self {
            capacity_kwh: 0.0,
            max_charge_kw: 0.0,
            max_discharge_kw: 0.0,
            round_trip_eff: 1.0,
            soc_min: 0.0,
            soc_max: 1.0,
            initial_soc: 0.0,
        }
    }

    /// Reject physically impossible parameters before the first tick.
    pub fn ensure_physical(&self) -> Result<()> {
        if !self.capacity_kwh.is_finite() || self.capacity_kwh < 0.0 {
            bail!("battery capacity_kwh must be finite and >= 0, got {}", self.capacity_kwh);
        }
        if !self.max_charge_kw.is_finite() || self.max_charge_kw < 0.0 {
            bail!("battery max_charge_kw must be finite and >= 0, got {}", self.max_charge_kw);
        }
        if !self.max_discharge_kw.is_finite() || self.max_discharge_kw < 0.0 {
            bail!(
                "battery max_discharge_kw must be finite and >= 0, got {}",
                self.max_discharge_kw
            );
        }
        if !self.round_trip_eff.is_finite()
            || self.round_trip_eff <= 0.0
            || self.round_trip_eff > 1.0
        {
            bail!("battery round_trip_eff must be in (0, 1], got {}", self.round_trip_eff);
        }
        if !(0.0..=1.0).contains(&self.soc_min) || !(0.0..=1.0).contains(&self.soc_max) {
            bail!("battery SOC bounds must be fractions in [0, 1]");
        }
        if self.soc_min > self.soc_max {
            bail!("battery soc_min {} exceeds soc_max {}", self.soc_min, self.soc_max);
        }
        if self.initial_soc < self.soc_min || self.initial_soc > self.soc_max {
            bail!(
                "battery initial_soc {} outside [{}, {}]",
                self.initial_soc,
                self.soc_min,
                self.soc_max
            );
        }
        Ok(())
    }

    /// Largest of the two rate limits, the scale for dispatch-gene noise.
    pub fn max_rate_kw(&self) -> f64 {
        self.max_charge_kw.max(self.max_discharge_kw)
    }
}
