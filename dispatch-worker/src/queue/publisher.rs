//! Async RabbitMQ publisher for batch wake-up notifications.
//!
//! The publisher keeps one connection and channel, reconnecting lazily when
//! the channel drops. It is cheap to clone and shared between tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{BatchReady, BATCH_QUEUE};

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

/// Declare the batch notification queue (idempotent).
pub async fn declare_batch_queue(channel: &Channel) -> Result<()> {
    channel
        .queue_declare(
            BATCH_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare batch queue")?;
    Ok(())
}

impl Publisher {
    pub fn new(url: String) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Another task may have reconnected while we waited for the lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;
        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;
        declare_batch_queue(&ch).await?;

        info!(queue = BATCH_QUEUE, "rabbitmq_publisher_connected");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Announce a campaign's freshly stored batches.
    pub async fn publish_batch_ready(&self, ready: &BatchReady) -> Result<()> {
        let channel = self.ensure_connected().await?;
        let body = serde_json::to_vec(ready).context("Failed to serialize notification")?;

        channel
            .basic_publish(
                "",
                BATCH_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(ready.campaign_id.clone().into()),
            )
            .await
            .context("Failed to publish batch notification")?
            .await
            .context("Failed to confirm publish")?;

        info!(
            queue = BATCH_QUEUE,
            campaign_id = %ready.campaign_id,
            jobs = ready.job_ids.len(),
            "rabbitmq_batch_ready_published"
        );

        Ok(())
    }

    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_broker_fails_cleanly() {
        // Port 1 is never an AMQP broker
        let publisher = Publisher::new("amqp://127.0.0.1:1/%2f".to_string());
        let ready = BatchReady {
            campaign_id: "c1".into(),
            owner_id: "o1".into(),
            job_ids: vec![],
        };
        assert!(publisher.publish_batch_ready(&ready).await.is_err());
        assert!(publisher.inner.channel.read().await.is_none());
    }
}
