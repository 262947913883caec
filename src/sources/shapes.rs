//! Attribute-shape resolution at the input boundary.
//!
//! Upstream entities publish their payloads in a handful of layouts; each
//! layout gets exactly one parser, and the rest of the core only ever sees
//! the typed variants produced here.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::ErrorKind;

/// One PV forecast sample at 30-minute cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PvSample {
    pub period_start: DateTime<Utc>,
    pub pv_estimate_kw: f64,
}

/// Recognized PV attribute layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum PvShape {
    DetailedForecast(Vec<PvSample>),
    DetailedHourly(Vec<PvSample>),
    Missing,
}

impl PvShape {
    pub fn into_samples(self) -> Vec<PvSample> {
        match self {
            Self::DetailedForecast(s) | Self::DetailedHourly(s) => s,
            Self::Missing => Vec::new(),
        }
    }
}

/// Recognized market-price layouts: an hourly map keyed `"HH:00"` in
/// EUR/MWh, or a flat array of 24 hourly values.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketShape {
    HourlyMap(Vec<(u32, f64)>),
    Array24(Vec<f64>),
    Missing,
}

/// Classify a PV entity's attributes. Malformed entries inside a
/// recognized shape are dropped and tagged; an attribute that exists but
/// is not an array is an unsupported shape.
pub fn classify_pv(attributes: &Value) -> (PvShape, Vec<ErrorKind>) {
    let shapes: [(&str, fn(Vec<PvSample>) -> PvShape); 2] = [
        ("DetailedForecast", PvShape::DetailedForecast),
        ("DetailedHourly", PvShape::DetailedHourly),
    ];
    for (key, wrap) in shapes {
        match attributes.get(key) {
            None => continue,
            Some(Value::Array(entries)) => {
                let (samples, dropped) = parse_pv_entries(entries);
                let mut tags = Vec::new();
                if dropped > 0 {
                    debug!(key, dropped, "dropped malformed PV samples");
                    tags.push(ErrorKind::MalformedSample);
                }
                return (wrap(samples), tags);
            }
            Some(_) => return (PvShape::Missing, vec![ErrorKind::UnsupportedShape]),
        }
    }
    (PvShape::Missing, Vec::new())
}

fn parse_pv_entries(entries: &[Value]) -> (Vec<PvSample>, usize) {
    let mut samples = Vec::with_capacity(entries.len());
    let mut dropped = 0usize;
    for entry in entries {
        match parse_pv_entry(entry) {
            Some(sample) => samples.push(sample),
            None => dropped += 1,
        }
    }
    (samples, dropped)
}

fn parse_pv_entry(entry: &Value) -> Option<PvSample> {
    let period_start = entry.get("period_start")?.as_str()?;
    let period_start = DateTime::parse_from_rfc3339(period_start)
        .ok()?
        .with_timezone(&Utc);
    let pv_estimate_kw = entry.get("pv_estimate")?.as_f64()?;
    if !pv_estimate_kw.is_finite() || pv_estimate_kw < 0.0 {
        return None;
    }
    Some(PvSample { period_start, pv_estimate_kw })
}

/// Classify a market-price entity's attributes.
pub fn classify_market(attributes: &Value) -> (MarketShape, Vec<ErrorKind>) {
    if let Some(value) = attributes.get("Today hours") {
        return match value {
            Value::Object(map) => {
                let mut hours: Vec<(u32, f64)> = Vec::with_capacity(map.len());
                let mut dropped = 0usize;
                for (key, price) in map {
                    match (parse_hour_key(key), price.as_f64()) {
                        (Some(hour), Some(p)) if p.is_finite() => hours.push((hour, p)),
                        _ => dropped += 1,
                    }
                }
                hours.sort_by_key(|(h, _)| *h);
                let mut tags = Vec::new();
                if dropped > 0 {
                    debug!(dropped, "dropped malformed hourly price entries");
                    tags.push(ErrorKind::MalformedSample);
                }
                if hours.is_empty() {
                    (MarketShape::Missing, vec![ErrorKind::NoMarketPrice])
                } else {
                    (MarketShape::HourlyMap(hours), tags)
                }
            }
            _ => (MarketShape::Missing, vec![ErrorKind::UnsupportedShape]),
        };
    }

    if let Some(value) = attributes.get("prices") {
        return match value {
            Value::Array(entries) => {
                let parsed: Vec<f64> = entries.iter().filter_map(Value::as_f64).collect();
                if parsed.len() == entries.len() && !parsed.is_empty() {
                    (MarketShape::Array24(parsed), Vec::new())
                } else {
                    (MarketShape::Missing, vec![ErrorKind::UnsupportedShape])
                }
            }
            _ => (MarketShape::Missing, vec![ErrorKind::UnsupportedShape]),
        };
    }

    (MarketShape::Missing, Vec::new())
}

/// Parse an `"HH:00"` map key into the hour it names.
fn parse_hour_key(key: &str) -> Option<u32> {
    let (hh, _rest) = key.split_once(':')?;
    let hour: u32 = hh.parse().ok()?;
    (hour < 24).then_some(hour)
}
