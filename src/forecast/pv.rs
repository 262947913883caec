//! PV forecast fusion: two 30-minute horizons (today, tomorrow) merged
//! into the 96-slot frame by linear interpolation at slot centers.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use tracing::{debug, warn};

use crate::domain::SlotSeries;
use crate::error::{Degraded, ErrorKind};
use crate::sources::shapes::PvSample;
use crate::timegrid::{TimeGrid, SLOTS_PER_DAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleOrigin {
    Today,
    Tomorrow,
}

/// Fuse the two source horizons into a per-slot kW series.
///
/// Pure function: malformed samples are dropped and tagged, duplicate
/// timestamps prefer the today horizon, slots outside fused coverage are
/// zero, and interpolated values are clipped at zero.
pub fn fuse(today: &[PvSample], tomorrow: &[PvSample], grid: &TimeGrid) -> Degraded<SlotSeries> {
    let mut tags = Vec::new();

    let mut merged: Vec<(PvSample, SampleOrigin)> = Vec::new();
    for (samples, origin) in [(today, SampleOrigin::Today), (tomorrow, SampleOrigin::Tomorrow)] {
        let before = samples.len();
        let clean = sanitize(samples);
        if clean.len() != before {
            debug!(origin = ?origin, dropped = before - clean.len(), "dropped malformed PV samples");
            tags.push(ErrorKind::MalformedSample);
        }
        merged.extend(clean.into_iter().map(|s| (s, origin)));
    }

    if merged.is_empty() {
        warn!("no PV forecast data from either horizon");
        tags.push(ErrorKind::NoPvData);
        return Degraded::with_tags(SlotSeries::zeros(), tags);
    }

    // Stable sort keeps today's entry first for equal timestamps, so the
    // dedup below prefers the today horizon.
    merged.sort_by_key(|(s, _)| s.period_start);
    merged.dedup_by_key(|(s, _)| s.period_start);
    let samples: Vec<PvSample> = merged.into_iter().map(|(s, _)| s).collect();

    let mut out = SlotSeries::zeros();
    let first = samples[0].period_start;
    let last = samples[samples.len() - 1].period_start;
    for slot in 0..SLOTS_PER_DAY {
        let center = grid.slot_center(slot);
        if center < first || center >= last {
            continue;
        }
        out.set(slot, interpolate(&samples, center).max(0.0));
    }

    Degraded::with_tags(out, tags)
}

/// Drop samples failing range checks or breaking monotone time order.
fn sanitize(samples: &[PvSample]) -> Vec<PvSample> {
    let mut out: Vec<PvSample> = Vec::with_capacity(samples.len());
    for sample in samples {
        if !sample.pv_estimate_kw.is_finite() || sample.pv_estimate_kw < 0.0 {
            continue;
        }
        if let Some(prev) = out.last() {
            if sample.period_start <= prev.period_start {
                continue;
            }
        }
        out.push(*sample);
    }
    out
}

/// Linear interpolation between the bracketing samples. Caller guarantees
/// `first <= at < last`.
fn interpolate(samples: &[PvSample], at: DateTime<Utc>) -> f64 {
    for (a, b) in samples.iter().tuple_windows() {
        if a.period_start <= at && at < b.period_start {
            let span = (b.period_start - a.period_start).num_milliseconds() as f64;
            let offset = (at - a.period_start).num_milliseconds() as f64;
            let w = offset / span;
            return (1.0 - w) * a.pv_estimate_kw + w * b.pv_estimate_kw;
        }
    }
    0.0
}
