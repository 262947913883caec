//! Indexed-tariff calculator: wholesale market price plus fixed regulatory
//! components, expanded to per-slot EUR/kWh.

use serde::{Deserialize, Serialize};

use crate::domain::SlotSeries;
use crate::error::{Degraded, ErrorKind};
use crate::sources::shapes::MarketShape;
use crate::timegrid::{TimeGrid, SLOTS_PER_DAY};

/// Lower bound on the produced price. Keeps downstream cost terms
/// sign-stable even when the market clears negative.
const PRICE_FLOOR_EUR_KWH: f64 = 1e-6;

/// Fixed tariff components and multipliers. `fp`, `q`, `tae`, `mfrr` are
/// the indexed-contract terms in EUR/MWh-compatible units; `vat` is the
/// tax multiplier; time-of-use and season factors scale per slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffParams {
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

impl Default for TariffParams {
    fn default() -> Self {
        Self {
            fp: 1.0,
            q: 0.0,
            tae: 0.0,
            mfrr: 0.0,
            vat: 1.23,
            peak_hours: vec![18, 19, 20],
            shoulder_hours: vec![8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 21],
            peak_factor: 1.0,
            shoulder_factor: 1.0,
            offpeak_factor: 1.0,
            summer_months: vec![4, 5, 6, 7, 8, 9],
            summer_factor: 1.0,
            winter_factor: 1.0,
            fallback_eur_per_mwh: 50.0,
            export_price_eur_per_kwh: 0.0,
        }
    }
}

impl TariffParams {
    fn tou_factor(&self, hour: u32) -> f64 {
        let hour = hour as u8;
        if self.peak_hours.contains(&hour) {
            self.peak_factor
        } else if self.shoulder_hours.contains(&hour) {
            self.shoulder_factor
        } else {
            self.offpeak_factor
        }
    }

    fn season_factor(&self, month: u32) -> f64 {
        if self.summer_months.contains(&(month as u8)) {
            self.summer_factor
        } else {
            self.winter_factor
        }
    }

    /// `((PM*FP + Q + TAE + MFRR) * VAT * TOU * SEASON) / 1000` EUR/kWh.
    fn slot_price(&self, market_eur_mwh: f64, hour: u32, month: u32) -> f64 {
        (market_eur_mwh * self.fp + self.q + self.tae + self.mfrr)
            * self.vat
            * self.tou_factor(hour)
            * self.season_factor(month)
            / 1000.0
    }
}

/// Wholesale EUR/MWh for a given hour, by nearest-lower-hour lookup.
fn market_at_hour(shape: &MarketShape, hour: u32, fallback: f64) -> (f64, bool) {
    let value = match shape {
        MarketShape::Missing => return (fallback, false),
        MarketShape::Array24(prices) => prices
            .get(hour as usize)
            .or_else(|| prices.last())
            .copied(),
        MarketShape::HourlyMap(hours) => hours
            .iter()
            .rev()
            .find(|(h, _)| *h <= hour)
            .or_else(|| hours.first())
            .map(|(_, p)| *p),
    };
    match value {
        Some(v) if v.is_finite() => (v, false),
        // Entry exists but is unusable: substitute and report.
        _ => (fallback, true),
    }
}

/// Compute the 96-slot price series. Total function: any input defect
/// degrades to the constant fallback market price and is tagged.
pub fn price_series(
    market: &MarketShape,
    params: &TariffParams,
    grid: &TimeGrid,
) -> Degraded<SlotSeries> {
    let month = grid.month();
    let mut tags = Vec::new();
    if matches!(market, MarketShape::Missing) {
        tags.push(ErrorKind::NoMarketPrice);
    }

    let mut out = SlotSeries::zeros();
    for slot in 0..SLOTS_PER_DAY {
        let hour = grid.slot_hour(slot);
        let (pm, degraded) = market_at_hour(market, hour, params.fallback_eur_per_mwh);
        if degraded {
            tags.push(ErrorKind::MalformedSample);
        }
        let mut price = params.slot_price(pm, hour, month);
        if !price.is_finite() || price < PRICE_FLOOR_EUR_KWH {
            price = PRICE_FLOOR_EUR_KWH;
        }
        out.set(slot, price);
    }

    Degraded::with_tags(out, tags)
}
