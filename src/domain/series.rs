use serde::{Deserialize, Serialize};
use std::ops::Index;
use thiserror::Error;

use crate::timegrid::SLOTS_PER_DAY;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected {SLOTS_PER_DAY} slot values, got {0}")]
pub struct SeriesLengthError(pub usize);

/// One value per 15-minute slot of the planning day.
///
/// Invariant: always exactly `SLOTS_PER_DAY` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotSeries(Vec<f64>);

impl SlotSeries {
    pub fn zeros() -> Self {
        Self::filled(0.0)
    }

    pub fn filled(value: f64) -> Self {
        Self(vec![value; SLOTS_PER_DAY])
    }

    pub fn from_vec(values: Vec<f64>) -> Result<Self, SeriesLengthError> {
        if values.len() != SLOTS_PER_DAY {
            return Err(SeriesLengthError(values.len()));
        }
        Ok(Self(values))
    }

    pub fn len(&self) -> usize {
        SLOTS_PER_DAY
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn set(&mut self, slot: usize, value: f64) {
        self.0[slot] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.0.iter().copied()
    }

    pub fn mean(&self) -> f64 {
        self.0.iter().sum::<f64>() / SLOTS_PER_DAY as f64
    }

    /// Clamp every slot to at least `floor`.
    pub fn clamp_min(&mut self, floor: f64) {
        for v in &mut self.0 {
            if *v < floor {
                *v = floor;
            }
        }
    }
}

impl Index<usize> for SlotSeries {
    type Output = f64;

    fn index(&self, slot: usize) -> &f64 {
        &self.0[slot]
    }
}
