use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gridplan::config::AppConfig;
use gridplan::controller::Scheduler;
use gridplan::sources::rest::{LogPlanSink, RestClient, RestPlanSink};
use gridplan::sources::{HistorySource, PlanSink, SystemClock};
use gridplan::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    telemetry::init_tracing(cfg.telemetry.log_json);

    let base_url = cfg
        .source
        .base_url
        .as_deref()
        .context("source.base_url must be configured")?;
    let timeout = Duration::from_secs(cfg.source.timeout_secs);
    let client = Arc::new(RestClient::new(base_url, cfg.source.token.as_deref(), timeout)?);

    let history: Option<Arc<dyn HistorySource>> = cfg
        .source
        .load_entity
        .as_ref()
        .map(|_| Arc::clone(&client) as Arc<dyn HistorySource>);

    let sink: Arc<dyn PlanSink> = match cfg.source.actuator_url.as_deref() {
        Some(url) => Arc::new(RestPlanSink::new(url, cfg.source.token.as_deref(), timeout)?),
        None => {
            warn!("no actuator_url configured, committed plans will only be logged");
            Arc::new(LogPlanSink)
        }
    };

    let scheduler = Arc::new(Scheduler::new(
        &cfg,
        client,
        history,
        sink,
        Arc::new(SystemClock),
    )?);

    info!(
        tick_minutes = cfg.controller.tick_minutes,
        devices = cfg.devices.len(),
        "starting gridplan scheduler"
    );

    let shutdown = CancellationToken::new();
    let loop_handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));

    telemetry::shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "scheduler task join failed");
    }

    warn!("shutdown complete");
    Ok(())
}
