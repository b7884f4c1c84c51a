//! Sendline Scheduler - promotes due campaigns into queued batches.
//!
//! Ticks once a minute by default. Also recomputes warmup stages and prunes
//! finished queue jobs on a slower cadence.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sendline::queue::{JobQueue, RetryPolicy};
use sendline::scheduler::{Dispatcher, SchedulerSettings};
use sendline::shutdown::watch_signals;
use sendline::{Config, Database, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("scheduler_starting");

    let config = Config::from_env();
    info!(
        database_path = %config.database_path,
        amqp_configured = config.amqp_url.is_some(),
        tick_secs = config.scheduler_tick_secs,
        batch_size = config.batch_size,
        max_campaigns_per_tick = config.scheduler_max_campaigns_per_tick,
        "config_loaded"
    );

    let db = Arc::new(Database::open(Path::new(&config.database_path))?);
    let queue = JobQueue::new(db.clone(), RetryPolicy::from_config(&config));
    let publisher = config.amqp_url.clone().map(Publisher::new);

    let dispatcher = Dispatcher::new(
        db,
        queue,
        publisher.clone(),
        SchedulerSettings::from_config(&config),
    );

    dispatcher.run(watch_signals()).await?;

    if let Some(publisher) = publisher {
        publisher.close().await;
    }

    info!("scheduler_shutdown_complete");
    Ok(())
}
