use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use super::{BatterySpec, DeviceControl, DeviceSpec, SlotSeries};
use crate::timegrid::SLOTS_PER_DAY;

/// A full-day dispatch: one activity row per device plus the battery row.
///
/// Device activity is 0/1 for binary devices and [0, 1] for fractional
/// ones; battery power is kW, positive charging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub device_activity: Vec<SlotSeries>,
    pub battery_kw: SlotSeries,
}

/// Errors returned when validating a dispatch plan against the specs that
/// produced it.
#[derive(Debug, Error, PartialEq)]
pub enum PlanValidationError {
    #[error("plan has {found} device rows, expected {expected}")]
    DeviceRowMismatch { expected: usize, found: usize },
    #[error("device {device} has non-finite activity at slot {slot}")]
    NonFiniteActivity { device: String, slot: usize },
    #[error("device {device} activity {value} out of [0, 1] at slot {slot}")]
    ActivityOutOfRange { device: String, slot: usize, value: f64 },
    #[error("device {device} is not binary at slot {slot} (activity {value})")]
    NotBinary { device: String, slot: usize, value: f64 },
    #[error("device {device} active outside its window at slot {slot}")]
    OutsideWindow { device: String, slot: usize },
    #[error("battery power {value} kW violates rate limits at slot {slot}")]
    BatteryRateExceeded { slot: usize, value: f64 },
    #[error("battery power is non-finite at slot {slot}")]
    NonFiniteBattery { slot: usize },
}

impl DispatchPlan {
    pub fn validate(
        &self,
        devices: &[DeviceSpec],
        battery: &BatterySpec,
    ) -> Result<(), PlanValidationError> {
        if self.device_activity.len() != devices.len() {
            return Err(PlanValidationError::DeviceRowMismatch {
                expected: devices.len(),
                found: self.device_activity.len(),
            });
        }

        for (spec, row) in devices.iter().zip(&self.device_activity) {
            let mask = spec.allowed_mask();
            for slot in 0..SLOTS_PER_DAY {
                let value = row[slot];
                if !value.is_finite() {
                    return Err(PlanValidationError::NonFiniteActivity {
                        device: spec.id.clone(),
                        slot,
                    });
                }
                if !(0.0..=1.0).contains(&value) {
                    return Err(PlanValidationError::ActivityOutOfRange {
                        device: spec.id.clone(),
                        slot,
                        value,
                    });
                }
                if spec.control == DeviceControl::Binary && value != 0.0 && value != 1.0 {
                    return Err(PlanValidationError::NotBinary {
                        device: spec.id.clone(),
                        slot,
                        value,
                    });
                }
                if !mask[slot] && value != 0.0 {
                    return Err(PlanValidationError::OutsideWindow {
                        device: spec.id.clone(),
                        slot,
                    });
                }
            }
        }

        for slot in 0..SLOTS_PER_DAY {
            let b = self.battery_kw[slot];
            if !b.is_finite() {
                return Err(PlanValidationError::NonFiniteBattery { slot });
            }
            if b > battery.max_charge_kw + 1e-9 || b < -battery.max_discharge_kw - 1e-9 {
                return Err(PlanValidationError::BatteryRateExceeded { slot, value: b });
            }
        }

        Ok(())
    }
}

/// Command for one device in the committed slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
}

/// The plan handed to the actuator sink: the commitment for the current
/// slot plus the advisory 96-slot horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedPlan {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Slot the first-slot commands apply to.
    pub commit_slot: usize,
    pub devices: BTreeMap<String, DeviceCommand>,
    pub battery_kw: f64,
    pub horizon: DispatchPlan,
}

impl PublishedPlan {
    pub fn from_plan(
        plan: DispatchPlan,
        devices: &[DeviceSpec],
        commit_slot: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut commands = BTreeMap::new();
        for (spec, row) in devices.iter().zip(&plan.device_activity) {
            let activity = row[commit_slot];
            let command = match spec.control {
                DeviceControl::Binary => DeviceCommand { on: activity >= 0.5, fraction: None },
                DeviceControl::Fractional => DeviceCommand {
                    on: activity > 0.0,
                    fraction: Some(activity),
                },
            };
            commands.insert(spec.id.clone(), command);
        }
        let battery_kw = plan.battery_kw[commit_slot];
        Self {
            id: Uuid::new_v4(),
            created_at,
            commit_slot,
            devices: commands,
            battery_kw,
            horizon: plan,
        }
    }
}
