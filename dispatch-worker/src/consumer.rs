//! RabbitMQ consumer for batch wake-up notifications.
//!
//! Deliveries carry no work themselves: each one only wakes the dispatch
//! worker, which claims jobs from the queue table. Messages are acked as soon
//! as the wake-up is delivered, and a lost connection is retried until
//! shutdown while the worker keeps polling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Connection, ConnectionProperties,
};
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use sendline::queue::{declare_batch_queue, BatchReady, BATCH_QUEUE};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Forward notifications to `wake` until `shutdown` flips.
pub async fn run(url: String, wake: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = consume(&url, &wake) => match result {
                Ok(()) => warn!("rabbitmq_consumer_closed"),
                Err(e) => error!(error = %e, "rabbitmq_consumer_failed"),
            },
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => info!("rabbitmq_reconnecting"),
            _ = shutdown.changed() => break,
        }
    }
    info!("rabbitmq_consumer_stopped");
}

async fn consume(url: &str, wake: &Notify) -> Result<()> {
    info!(url_length = url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;
    let channel = conn
        .create_channel()
        .await
        .context("Failed to create channel")?;

    channel
        .basic_qos(16, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;
    declare_batch_queue(&channel).await?;

    let mut consumer = channel
        .basic_consume(
            BATCH_QUEUE,
            "sendline-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = BATCH_QUEUE, "rabbitmq_consumer_started");

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.context("Delivery error")?;

        match serde_json::from_slice::<BatchReady>(&delivery.data) {
            Ok(ready) => info!(
                campaign_id = %ready.campaign_id,
                jobs = ready.job_ids.len(),
                "rabbitmq_batch_ready_received"
            ),
            // Still a valid reason to look at the queue
            Err(e) => warn!(error = %e, "rabbitmq_batch_ready_parse_failed"),
        }
        wake.notify_one();

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(delivery_tag = delivery.delivery_tag, error = %e, "rabbitmq_ack_failed");
        }
    }

    Ok(())
}
