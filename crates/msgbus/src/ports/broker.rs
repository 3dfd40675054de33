//! Outbound ports (driven): what the bus needs from a broker client.
//!
//! The services layer only ever talks to these traits. `adapters::amqp`
//! implements them over lapin, `adapters::memory` over an in-process broker.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

use crate::domain::{AckMode, DeclaredQueue, Envelope, ExchangeSpec, QueueSpec};
use crate::error::BusError;

/// Stream of deliveries from one consumer. Ends when the consumer is
/// cancelled or its channel/connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BusError>>;

/// Opens connections to a broker address.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, BusError>;
}

/// One long-lived broker connection. Safe to open channels concurrently.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new logical channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError>;

    /// Close the connection; all channels and consumer streams end.
    async fn close(&self) -> Result<(), BusError>;

    fn is_closed(&self) -> bool;
}

/// A logical channel. Not meant to be shared by simultaneous operations.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BusError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, BusError>;

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BusError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Permanently remove the message from its queue.
    async fn ack(&self) -> Result<(), BusError>;

    /// Reject the message, optionally returning it to the queue.
    async fn nack(&self, requeue: bool) -> Result<(), BusError>;
}

/// Acker for deliveries received in auto-ack mode: there is nothing to
/// settle, so both operations are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAcked;

#[async_trait]
impl Acker for AutoAcked {
    async fn ack(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), BusError> {
        Ok(())
    }
}

/// A message handed to a consumer.
///
/// Settlement belongs to the dispatcher: handlers can read a delivery but
/// not ack or nack it.
///
/// ```compile_fail
/// # async fn settle(delivery: msgbus::Delivery) {
/// delivery.nack(true).await.ok();
/// # }
/// ```
#[derive(Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub(crate) acker: Arc<dyn Acker>,
}

impl Delivery {
    /// Delivery settled through `acker`. For broker adapters.
    pub fn new(
        envelope: Envelope,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            envelope,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.envelope.reply_to.as_deref()
    }

    pub(crate) async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub(crate) async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("correlation_id", &self.envelope.correlation_id)
            .field("body_len", &self.envelope.body.len())
            .finish()
    }
}
