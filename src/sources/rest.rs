//! REST adapter for a Home-Assistant-style host platform.
//!
//! This is the only module that talks HTTP; everything behind the port
//! traits is typed. Native transport errors are adapted into `anyhow`
//! results here and degrade into fallbacks upstream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use super::{EntityState, HistorySample, HistorySource, PlanSink, TimeSeriesSource};
use crate::domain::PublishedPlan;

#[derive(Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("gridplan/0.3"));
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("source token is not a valid header value")?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawEntityState {
    state: String,
    #[serde(default)]
    attributes: serde_json::Value,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawHistoryPoint {
    state: String,
    last_updated: DateTime<Utc>,
}

#[async_trait]
impl TimeSeriesSource for RestClient {
    async fn read_series(&self, entity_id: &str) -> Result<EntityState> {
        let url = format!("{}/api/states/{entity_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("state GET failed for {entity_id}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("state API error for {entity_id}: HTTP {status}");
        }
        let raw: RawEntityState = resp
            .json()
            .await
            .with_context(|| format!("state JSON parse failed for {entity_id}"))?;
        Ok(EntityState {
            state: raw.state,
            attributes: raw.attributes,
            last_updated: raw.last_updated,
        })
    }
}

#[async_trait]
impl HistorySource for RestClient {
    async fn read_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        significant_only: bool,
    ) -> Result<Vec<HistorySample>> {
        let url = format!(
            "{}/api/history/period/{}",
            self.base_url,
            start.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let end_time = end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("filter_entity_id", entity_id),
                ("end_time", end_time.as_str()),
                (
                    "significant_changes_only",
                    if significant_only { "1" } else { "0" },
                ),
            ])
            .send()
            .await
            .with_context(|| format!("history GET failed for {entity_id}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("history API error for {entity_id}: HTTP {status}");
        }
        // The history endpoint answers one list of points per requested
        // entity; we asked for exactly one.
        let raw: Vec<Vec<RawHistoryPoint>> = resp
            .json()
            .await
            .with_context(|| format!("history JSON parse failed for {entity_id}"))?;
        Ok(raw
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|p| HistorySample { timestamp: p.last_updated, state: p.state })
            .collect())
    }
}

/// Sink that POSTs the committed plan to an actuator webhook.
#[derive(Clone)]
pub struct RestPlanSink {
    url: String,
    client: reqwest::Client,
}

impl RestPlanSink {
    pub fn new(url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let rest = RestClient::new(url, token, timeout)?;
        Ok(Self { url: rest.base_url, client: rest.client })
    }
}

#[async_trait]
impl PlanSink for RestPlanSink {
    async fn publish_plan(&self, plan: &PublishedPlan) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(plan)
            .send()
            .await
            .context("plan POST failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("actuator sink rejected plan: HTTP {status}");
        }
        Ok(())
    }
}

/// Sink used when no actuator endpoint is configured: the committed slot
/// is only logged. Keeps the control loop observable on a bench setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPlanSink;

#[async_trait]
impl PlanSink for LogPlanSink {
    async fn publish_plan(&self, plan: &PublishedPlan) -> Result<()> {
        info!(
            plan_id = %plan.id,
            commit_slot = plan.commit_slot,
            battery_kw = plan.battery_kw,
            devices_on = plan.devices.values().filter(|c| c.on).count(),
            "plan committed (log sink)"
        );
        Ok(())
    }
}
