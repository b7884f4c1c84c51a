//! Sendline Worker - throttled campaign batch dispatcher.
//!
//! Claims batches from the durable queue, one owner at a time, and sends each
//! recipient through the provider at the configured rate. RabbitMQ
//! notifications wake the worker early; without them it polls.

mod consumer;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sendline::queue::{JobQueue, RetryPolicy};
use sendline::send::{HttpProvider, SendAdapter};
use sendline::shutdown::watch_signals;
use sendline::tracking::{TrackingGateway, TrackingUrls};
use sendline::worker::{DispatchSettings, DispatchWorker};
use sendline::{Config, Database, ProgressHub};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    let config = Config::from_env();
    info!(
        database_path = %config.database_path,
        amqp_configured = config.amqp_url.is_some(),
        send_rate_per_second = config.send_rate_per_second,
        inter_batch_pause_ms = config.inter_batch_pause_ms,
        job_max_attempts = config.job_max_attempts,
        "config_loaded"
    );

    let api_key = config
        .provider_api_key
        .as_deref()
        .context("PROVIDER_API_KEY must be set")?;
    let secret = config
        .tracking_secret
        .clone()
        .context("TRACKING_SECRET must be set")?;

    let db = Arc::new(Database::open(Path::new(&config.database_path))?);
    let queue = JobQueue::new(db.clone(), RetryPolicy::from_config(&config));
    let provider = HttpProvider::new(
        &config.provider_api_url,
        api_key,
        std::time::Duration::from_millis(config.provider_timeout_ms),
    )?;
    let gateway = TrackingGateway::new(TrackingUrls::new(config.tracking_base_url.clone(), secret));

    let progress = ProgressHub::default();
    let mut updates = progress.subscribe();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            debug!(
                campaign_id = %update.campaign_id,
                job_id = %update.job_id,
                sent = update.counts.sent,
                failed = update.counts.failed,
                skipped = update.counts.skipped,
                total = update.counts.total,
                finished = update.finished,
                "batch_progress"
            );
        }
    });

    let worker = DispatchWorker::new(
        db,
        queue,
        SendAdapter::new(provider, gateway),
        progress,
        DispatchSettings::from_config(&config),
    );

    let shutdown = watch_signals();
    let wake = Arc::new(Notify::new());

    match config.amqp_url.clone() {
        Some(url) => {
            tokio::spawn(consumer::run(url, wake.clone(), shutdown.clone()));
        }
        None => warn!("amqp_not_configured_polling_only"),
    }

    worker.run(wake, shutdown).await?;

    info!("worker_shutdown_complete");
    Ok(())
}
