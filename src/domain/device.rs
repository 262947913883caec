use serde::{Deserialize, Serialize};

use crate::timegrid::{SLOTS_PER_DAY, SLOT_HOURS};

/// How a device accepts commands: on/off only, or a duty fraction in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceControl {
    Binary,
    Fractional,
}

/// Hard scheduling window for a device, in slot indices.
///
/// The device may only run in `[earliest_slot, latest_slot)` and must
/// receive `required_energy_kwh` within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceWindow {
    pub earliest_slot: usize,
    pub latest_slot: usize,
    pub min_runtime_slots: usize,
    pub required_energy_kwh: f64,
}

impl DeviceWindow {
    pub fn width_slots(&self) -> usize {
        self.latest_slot.saturating_sub(self.earliest_slot)
    }
}

/// Immutable per-device parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub power_kw: f64,
    /// Relative importance in [0, 1]; scales the penalty for missing the
    /// device's windowed energy requirement.
    pub priority: f64,
    pub control: DeviceControl,
    pub window: Option<DeviceWindow>,
}

impl DeviceSpec {
    /// Slots where the device is allowed to run. Windowing is a hard
    /// constraint: genes outside the mask are forced to zero.
    pub fn allowed_mask(&self) -> Vec<bool> {
        match &self.window {
            None => vec![true; SLOTS_PER_DAY],
            Some(w) => {
                let mut mask = vec![false; SLOTS_PER_DAY];
                let end = w.latest_slot.min(SLOTS_PER_DAY);
                for slot in mask.iter_mut().take(end).skip(w.earliest_slot) {
                    *slot = true;
                }
                mask
            }
        }
    }

    /// Upper bound on energy deliverable inside the window.
    pub fn max_window_energy_kwh(&self) -> f64 {
        match &self.window {
            None => self.power_kw * SLOTS_PER_DAY as f64 * SLOT_HOURS,
            Some(w) => self.power_kw * w.width_slots() as f64 * SLOT_HOURS,
        }
    }

    /// True when the windowed energy requirement cannot be met even at
    /// full-rate operation across the whole window.
    pub fn is_infeasible(&self) -> bool {
        match &self.window {
            None => false,
            Some(w) => w.required_energy_kwh > self.max_window_energy_kwh() + 1e-9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windowed(required: f64) -> DeviceSpec {
        DeviceSpec {
            id: "heater".into(),
            power_kw: 1.0,
            priority: 0.8,
            control: DeviceControl::Binary,
            window: Some(DeviceWindow {
                earliest_slot: 64, // 16:00
                latest_slot: 92,   // 23:00
                min_runtime_slots: 2,
                required_energy_kwh: required,
            }),
        }
    }

    #[test]
    fn mask_is_true_only_inside_window() {
        let mask = windowed(2.0).allowed_mask();
        assert!(!mask[63]);
        assert!(mask[64]);
        assert!(mask[91]);
        assert!(!mask[92]);
        assert_eq!(mask.iter().filter(|m| **m).count(), 28);
    }

    #[test]
    fn unwindowed_mask_is_all_true() {
        let spec = DeviceSpec {
            id: "pump".into(),
            power_kw: 0.5,
            priority: 0.5,
            control: DeviceControl::Fractional,
            window: None,
        };
        assert!(spec.allowed_mask().iter().all(|m| *m));
        assert!(!spec.is_infeasible());
    }

    #[test]
    fn window_energy_bound_detects_infeasibility() {
        // 28 slots at 1 kW -> 7 kWh ceiling.
        assert!((windowed(2.0).max_window_energy_kwh() - 7.0).abs() < 1e-12);
        assert!(!windowed(7.0).is_infeasible());
        assert!(windowed(7.5).is_infeasible());
    }
}
