pub mod rest;
pub mod shapes;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Snapshot of a host-platform entity: its scalar state plus the attribute
/// document the forecast parsers read.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub state: String,
    pub attributes: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

/// One recorded state change from the history backend.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySample {
    pub timestamp: DateTime<Utc>,
    pub state: String,
}

/// Read-side port for forecast and market entities.
#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    async fn read_series(&self, entity_id: &str) -> Result<EntityState>;
}

/// Read-side port for recorded sensor history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn read_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        significant_only: bool,
    ) -> Result<Vec<HistorySample>>;
}

/// Write-side port towards the device and battery actuators.
#[async_trait]
pub trait PlanSink: Send + Sync {
    async fn publish_plan(&self, plan: &crate::domain::PublishedPlan) -> Result<()>;
}

/// Time port, abstracted so tests can pin the wall clock.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Stable fingerprint of any hashable key material, used for cache keys
/// and change detection.
pub fn fingerprint_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Fingerprint of a JSON attribute document via its canonical rendering.
pub fn fingerprint_json(value: &serde_json::Value) -> u64 {
    fingerprint_of(value.to_string().as_str())
}
