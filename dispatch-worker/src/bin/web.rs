//! Sendline Web Server - tracking endpoints, provider webhook and control
//! surface.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sendline::queue::{JobQueue, RetryPolicy};
use sendline::scheduler::{Dispatcher, SchedulerSettings};
use sendline::shutdown::signal_received;
use sendline::web::{router, AppState};
use sendline::{Config, Database, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        tracking_base_url = %config.tracking_base_url,
        tracking_secret_configured = config.tracking_secret.is_some(),
        webhook_signing_configured = config.webhook_signing_key.is_some(),
        control_token_configured = config.control_api_token.is_some(),
        "config_loaded"
    );

    let db = Arc::new(Database::open(Path::new(&config.database_path))?);
    let queue = JobQueue::new(db.clone(), RetryPolicy::from_config(&config));
    // Send-now from the dashboard enqueues through the same path as the scheduler
    let publisher = config.amqp_url.clone().map(Publisher::new);
    let dispatcher = Dispatcher::new(
        db.clone(),
        queue.clone(),
        publisher.clone(),
        SchedulerSettings::from_config(&config),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(config, db, queue, dispatcher));

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            signal_received().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    if let Some(publisher) = publisher {
        publisher.close().await;
    }

    info!("web_server_shutdown_complete");
    Ok(())
}
