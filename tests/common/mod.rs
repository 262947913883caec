#![allow(dead_code)]
//! In-memory ports shared by the integration tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use gridplan::config::AppConfig;
use gridplan::domain::PublishedPlan;
use gridplan::sources::{
    Clock, EntityState, HistorySample, HistorySource, PlanSink, TimeSeriesSource,
};

/// Noon UTC on the reference test day.
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Entity attribute documents served verbatim.
#[derive(Default)]
pub struct StaticSource {
    entities: HashMap<String, serde_json::Value>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity_id: &str, attributes: serde_json::Value) -> Self {
        self.entities.insert(entity_id.to_string(), attributes);
        self
    }
}

#[async_trait]
impl TimeSeriesSource for StaticSource {
    async fn read_series(&self, entity_id: &str) -> Result<EntityState> {
        let attributes = self
            .entities
            .get(entity_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown entity {entity_id}"))?;
        Ok(EntityState { state: "ok".into(), attributes, last_updated: test_now() })
    }
}

pub struct StaticHistory(pub Vec<HistorySample>);

#[async_trait]
impl HistorySource for StaticHistory {
    async fn read_history(
        &self,
        _entity_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _significant_only: bool,
    ) -> Result<Vec<HistorySample>> {
        Ok(self.0.clone())
    }
}

/// Sink that records every published plan; individual calls can be armed
/// to fail by their zero-based call index.
#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<PublishedPlan>>,
    calls: AtomicUsize,
    fail_calls: Mutex<HashSet<usize>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on_call(&self, call: usize) {
        self.fail_calls.lock().unwrap().insert(call);
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<PublishedPlan> {
        self.published.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PlanSink for RecordingSink {
    async fn publish_plan(&self, plan: &PublishedPlan) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_calls.lock().unwrap().remove(&call) {
            anyhow::bail!("sink rejected plan");
        }
        self.published.lock().unwrap().push(plan.clone());
        Ok(())
    }
}

/// Small, fast, reproducible configuration for controller tests.
pub fn base_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.timezone = "UTC".to_string();
    cfg.optimizer.population_size = 30;
    cfg.optimizer.generations_max = 40;
    cfg.optimizer.stall_gens = 10;
    cfg.optimizer.seed = Some(42);
    cfg.optimizer.workers = 2;
    cfg.controller.tick_budget_s = 30;
    cfg
}

/// 24 flat hourly market prices as a `prices` attribute document.
pub fn market_attrs(eur_per_mwh: f64) -> serde_json::Value {
    serde_json::json!({ "prices": vec![eur_per_mwh; 24] })
}

/// A `DetailedForecast` document with 30-minute samples spanning the
/// whole test day, `kw` between 10:00 and 16:00 and zero elsewhere.
pub fn pv_attrs_daytime(kw: f64) -> serde_json::Value {
    let mut entries = Vec::new();
    for half_hour in 0..49 {
        let ts = Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap()
            + chrono::Duration::minutes(30 * half_hour);
        let hour = 30 * half_hour / 60;
        let value = if (10..16).contains(&hour) { kw } else { 0.0 };
        entries.push(serde_json::json!({
            "period_start": ts.to_rfc3339(),
            "pv_estimate": value,
        }));
    }
    serde_json::json!({ "DetailedForecast": entries })
}
