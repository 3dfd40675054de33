//! Fire-and-forget publishing.
//!
//! Failures are returned to the caller as-is. Nothing here retries.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use crate::domain::{Envelope, ExchangeKind, QueueSpec, CONTENT_TYPE_JSON, DEFAULT_EXCHANGE};
use crate::error::Result;
use crate::metrics::MetricsRecorder;
use crate::ports::BrokerChannel;
use crate::service::connection::ConnectionManager;
use crate::service::topology::TopologyManager;

pub struct Publisher {
    connection: Arc<ConnectionManager>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            connection,
            metrics,
        }
    }

    /// Declare `exchange` and `queue`, bind them with `routing_key`, and
    /// publish `body` with no envelope properties.
    pub async fn publish(
        &self,
        body: impl Into<Vec<u8>>,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        kind: ExchangeKind,
    ) -> Result<()> {
        let channel = self.connection.acquire_channel().await?;
        let result = async {
            TopologyManager::new(&*channel)
                .ensure_route(queue, exchange, routing_key, kind)
                .await?;
            send(
                &*channel,
                self.metrics.as_ref(),
                exchange,
                routing_key,
                Envelope::new(body),
            )
            .await
        }
        .await;
        channel.release().await;
        result
    }

    /// Point-to-point send through the default exchange, addressed by queue
    /// name. With `init_queue` the queue is declared first.
    pub async fn publish_on_queue(
        &self,
        body: impl Into<Vec<u8>>,
        queue: &str,
        init_queue: bool,
    ) -> Result<()> {
        let channel = self.connection.acquire_channel().await?;
        let result = async {
            if init_queue {
                TopologyManager::new(&*channel)
                    .declare_queue(&QueueSpec::new(queue))
                    .await?;
            }
            let envelope = Envelope::new(body).with_content_type(CONTENT_TYPE_JSON);
            send(
                &*channel,
                self.metrics.as_ref(),
                DEFAULT_EXCHANGE,
                queue,
                envelope,
            )
            .await
        }
        .await;
        channel.release().await;
        result
    }

    /// Serialize `value` as JSON and publish it on an existing exchange.
    pub async fn publish_json<T>(&self, exchange: &str, routing_key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope::json(value)?;
        let channel = self.connection.acquire_channel().await?;
        let result = send(
            &*channel,
            self.metrics.as_ref(),
            exchange,
            routing_key,
            envelope,
        )
        .await;
        channel.release().await;
        result
    }
}

/// Publish one envelope, logging and recording the outcome.
pub(crate) async fn send(
    channel: &dyn BrokerChannel,
    metrics: &dyn MetricsRecorder,
    exchange: &str,
    routing_key: &str,
    envelope: Envelope,
) -> Result<()> {
    let len = envelope.body.len();
    match channel.publish(exchange, routing_key, envelope).await {
        Ok(()) => {
            metrics.record_published(exchange);
            debug!(exchange = %exchange, routing_key = %routing_key, bytes = len, "Message sent");
            Ok(())
        }
        Err(e) => {
            metrics.record_publish_failure(exchange);
            error!(exchange = %exchange, routing_key = %routing_key, error = %e, "Failed to publish message");
            Err(e)
        }
    }
}
