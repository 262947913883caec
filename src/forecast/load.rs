//! Household load synthesis: recorded history when available, a diurnal
//! template otherwise, and a constant floor as the last resort.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::SlotSeries;
use crate::error::{Degraded, ErrorKind};
use crate::sources::{Clock, HistorySource};
use crate::timegrid::{TimeGrid, SLOTS_PER_DAY, SLOT_MINUTES};

/// Constant output when even the template is unusable.
const LAST_RESORT_KW: f64 = 0.1;

/// Piecewise-linear daily load curve. Breakpoints are (minute-of-day, kW)
/// pairs; values between breakpoints interpolate linearly and the curve
/// wraps across midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiurnalTemplate {
    pub breakpoints: Vec<(u32, f64)>,
}

impl Default for DiurnalTemplate {
    fn default() -> Self {
        // Night base, morning ramp, daytime plateau, evening peak.
        Self {
            breakpoints: vec![
                (0, 0.2),     // 00:00
                (360, 0.2),   // 06:00
                (450, 1.5),   // 07:30 morning peak
                (540, 0.5),   // 09:00
                (1020, 0.5),  // 17:00
                (1140, 3.0),  // 19:00 evening peak
                (1320, 0.2),  // 22:00
            ],
        }
    }
}

impl DiurnalTemplate {
    pub fn value_at(&self, minute_of_day: f64) -> f64 {
        if self.breakpoints.is_empty() {
            return LAST_RESORT_KW;
        }
        if self.breakpoints.len() == 1 {
            return self.breakpoints[0].1.max(0.0);
        }

        let day = 1440.0;
        let m = minute_of_day.rem_euclid(day);

        // Find the bracketing pair, wrapping the last breakpoint to the
        // first across midnight.
        for pair in self.breakpoints.windows(2) {
            let (m0, v0) = (f64::from(pair[0].0), pair[0].1);
            let (m1, v1) = (f64::from(pair[1].0), pair[1].1);
            if m >= m0 && m < m1 {
                let w = (m - m0) / (m1 - m0);
                return ((1.0 - w) * v0 + w * v1).max(0.0);
            }
        }

        let (last_m, last_v) = self.breakpoints[self.breakpoints.len() - 1];
        let (first_m, first_v) = self.breakpoints[0];
        let span = day - f64::from(last_m) + f64::from(first_m);
        if m >= f64::from(last_m) {
            let w = (m - f64::from(last_m)) / span;
            ((1.0 - w) * last_v + w * first_v).max(0.0)
        } else {
            // Before the first breakpoint.
            let w = (m + day - f64::from(last_m)) / span;
            ((1.0 - w) * last_v + w * first_v).max(0.0)
        }
    }

    /// Sample the curve at every slot center.
    pub fn series(&self) -> SlotSeries {
        let mut out = SlotSeries::zeros();
        for slot in 0..SLOTS_PER_DAY {
            let minute = slot as f64 * f64::from(SLOT_MINUTES) + 7.5;
            out.set(slot, self.value_at(minute));
        }
        out
    }
}

/// Acceptable range for the daily-mean load when history is used; a mean
/// outside it means the sensor fed garbage and the template wins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlausibilityEnvelope {
    pub min_mean_kw: f64,
    pub max_mean_kw: f64,
}

impl Default for PlausibilityEnvelope {
    fn default() -> Self {
        Self { min_mean_kw: 0.05, max_mean_kw: 8.0 }
    }
}

/// Produce the 96-slot load forecast.
///
/// Selection order: recorded history (most recent sample wins per slot,
/// template fills gaps) -> diurnal template -> constant floor. Never
/// negative, never fails.
pub async fn synthesize(
    history: Option<&dyn HistorySource>,
    entity_id: Option<&str>,
    grid: &TimeGrid,
    template: &DiurnalTemplate,
    envelope: PlausibilityEnvelope,
    clock: &dyn Clock,
) -> Degraded<SlotSeries> {
    let template_series = template.series();
    let template_degraded = template.breakpoints.is_empty();

    let (source, entity_id) = match (history, entity_id) {
        (Some(source), Some(entity_id)) => (source, entity_id),
        _ => {
            let mut result = Degraded::tagged(template_series, ErrorKind::HistoryUnavailable);
            if template_degraded {
                result.value = SlotSeries::filled(LAST_RESORT_KW);
            }
            return result;
        }
    };

    let end = clock.now_utc();
    let start = end - Duration::hours(24);
    let mut samples = match source.read_history(entity_id, start, end, true).await {
        Ok(samples) => samples,
        Err(e) => {
            warn!(error = %e, entity_id, "history read failed, using diurnal template");
            return Degraded::tagged(template_series, ErrorKind::HistoryUnavailable);
        }
    };
    // The source guarantees no ordering; sort so the overwrite below
    // always lets the most recent sample win its slot.
    samples.sort_by_key(|s| s.timestamp);

    let mut tags = Vec::new();
    let mut out = template_series.clone();
    let mut assigned = 0usize;
    let mut malformed = 0usize;
    for sample in &samples {
        let Ok(kw) = sample.state.parse::<f64>() else {
            malformed += 1;
            continue;
        };
        if !kw.is_finite() {
            malformed += 1;
            continue;
        }
        // Samples are applied oldest first; later assignments overwrite,
        // so the most recent sample wins for its slot.
        let slot = grid.slot_of_clock(sample.timestamp);
        out.set(slot, kw.max(0.0));
        assigned += 1;
    }
    if malformed > 0 {
        debug!(malformed, entity_id, "discarded unparseable history samples");
        tags.push(ErrorKind::MalformedSample);
    }

    if assigned == 0 {
        tags.push(ErrorKind::HistoryUnavailable);
        return Degraded::with_tags(template_series, tags);
    }

    let mean = out.mean();
    if mean < envelope.min_mean_kw || mean > envelope.max_mean_kw {
        warn!(
            mean_kw = mean,
            entity_id, "history mean outside plausibility envelope, using template"
        );
        tags.push(ErrorKind::HistoryUnavailable);
        return Degraded::with_tags(template_series, tags);
    }

    Degraded::with_tags(out, tags)
}
