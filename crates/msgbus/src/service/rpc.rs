//! Request/reply over pub/sub.
//!
//! A request consumes the broker's direct reply-to pseudo queue on its own
//! channel, publishes with a fresh correlation id, and waits for the reply
//! carrying that id. Replies with any other id are discarded. Each request
//! has its own reply consumer, so concurrent requests never see each
//! other's replies.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{
    new_correlation_id, AckMode, Envelope, ExchangeKind, RoutingKey, RpcOutcome, RpcResult,
    CONTENT_TYPE_TEXT, DEFAULT_EXCHANGE, DIRECT_REPLY_TO,
};
use crate::error::{BusError, Result};
use crate::metrics::MetricsRecorder;
use crate::ports::{Delivery, DeliveryStream};
use crate::service::connection::ConnectionManager;
use crate::service::publisher::send;
use crate::service::topology::TopologyManager;

/// Sends requests and waits for their replies.
pub struct RpcRequester {
    connection: Arc<ConnectionManager>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl RpcRequester {
    pub fn new(connection: Arc<ConnectionManager>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            connection,
            metrics,
        }
    }

    /// Publish `body` as a request and wait up to `timeout` for the reply.
    ///
    /// Topology and publish failures are errors. How the wait ended
    /// (reply, reply stream closed, deadline) is reported in the result.
    pub async fn request(
        &self,
        body: impl Into<Vec<u8>>,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        kind: ExchangeKind,
        timeout: Duration,
    ) -> Result<RpcResult> {
        let channel = self.connection.acquire_channel().await?;
        let correlation_id = new_correlation_id();

        let prepared = async {
            TopologyManager::new(&*channel)
                .ensure_route(queue, exchange, routing_key, kind)
                .await?;
            let replies = channel
                .consume(
                    DIRECT_REPLY_TO,
                    &self.connection.config().reply_consumer_tag,
                    AckMode::Auto,
                )
                .await?;
            let request = Envelope::new(body)
                .with_content_type(CONTENT_TYPE_TEXT)
                .with_correlation_id(correlation_id.clone())
                .with_reply_to(DIRECT_REPLY_TO);
            send(
                &*channel,
                self.metrics.as_ref(),
                exchange,
                routing_key,
                request,
            )
            .await?;
            Ok::<_, BusError>(replies)
        }
        .await;

        let mut replies = match prepared {
            Ok(replies) => replies,
            Err(e) => {
                channel.release().await;
                return Err(e);
            }
        };
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            "RPC request sent"
        );

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            timeout,
            self.await_reply(&mut replies, &correlation_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => RpcOutcome::TimedOut,
        };
        let elapsed = started.elapsed();
        drop(replies);
        channel.release().await;

        self.metrics.record_rpc(&outcome, elapsed);
        match &outcome {
            RpcOutcome::Replied(_) => debug!(
                correlation_id = %correlation_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "RPC reply received"
            ),
            other => warn!(
                routing_key = %routing_key,
                correlation_id = %correlation_id,
                outcome = other.label(),
                "RPC request finished without reply"
            ),
        }

        Ok(RpcResult {
            routing_key: RoutingKey::new(routing_key),
            correlation_id,
            outcome,
        })
    }

    async fn await_reply(&self, replies: &mut DeliveryStream, correlation_id: &str) -> RpcOutcome {
        while let Some(next) = replies.next().await {
            match next {
                Ok(delivery) if delivery.envelope.correlates_with(correlation_id) => {
                    return RpcOutcome::Replied(delivery.envelope);
                }
                Ok(delivery) => {
                    self.metrics.record_correlation_mismatch();
                    debug!(
                        expected = %correlation_id,
                        received = ?delivery.correlation_id(),
                        "Discarding reply for another request"
                    );
                }
                Err(e) => {
                    warn!(correlation_id = %correlation_id, error = %e, "Reply stream failed");
                    break;
                }
            }
        }
        RpcOutcome::StreamClosed
    }
}

/// Answers requests received by a subscription.
pub struct RpcResponder {
    connection: Arc<ConnectionManager>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl RpcResponder {
    pub fn new(connection: Arc<ConnectionManager>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            connection,
            metrics,
        }
    }

    /// Publish `body` on the default exchange to `destination`, echoing
    /// `correlation_id` unchanged.
    pub async fn reply(
        &self,
        body: impl Into<Vec<u8>>,
        correlation_id: &str,
        destination: &str,
    ) -> Result<()> {
        let envelope = Envelope::new(body)
            .with_content_type(CONTENT_TYPE_TEXT)
            .with_correlation_id(correlation_id);
        let channel = self.connection.acquire_channel().await?;
        let result = send(
            &*channel,
            self.metrics.as_ref(),
            DEFAULT_EXCHANGE,
            destination,
            envelope,
        )
        .await;
        channel.release().await;
        result
    }

    /// Reply to `request` at its reply-to address.
    pub async fn respond(&self, request: &Delivery, body: impl Into<Vec<u8>>) -> Result<()> {
        let (Some(reply_to), Some(correlation_id)) = (request.reply_to(), request.correlation_id())
        else {
            return Err(BusError::publish(
                DEFAULT_EXCHANGE,
                &request.routing_key,
                "request carries no reply-to address or correlation id",
            ));
        };
        self.reply(body, correlation_id, reply_to).await
    }
}
