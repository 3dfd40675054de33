//! Exchange, queue and binding declaration.
//!
//! Every declaration is idempotent on the broker side: repeating one with
//! identical parameters is a no-op, so callers declare what they need on
//! every use instead of tracking what already exists.

use tracing::{debug, error};

use crate::config::QueueBinding;
use crate::domain::{DeclaredQueue, ExchangeKind, ExchangeSpec, QueueSpec, DEFAULT_EXCHANGE};
use crate::error::Result;
use crate::ports::BrokerChannel;

/// Declares topology on one borrowed channel.
pub struct TopologyManager<'a> {
    channel: &'a dyn BrokerChannel,
}

impl<'a> TopologyManager<'a> {
    pub fn new(channel: &'a dyn BrokerChannel) -> Self {
        Self { channel }
    }

    /// Declare a durable exchange. The default exchange always exists and is
    /// skipped.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        if name == DEFAULT_EXCHANGE {
            return Ok(());
        }
        self.channel
            .declare_exchange(&ExchangeSpec::new(name, kind))
            .await
            .inspect_err(|e| error!(exchange = %name, kind = %kind, error = %e, "Failed to declare exchange"))?;
        debug!(exchange = %name, kind = %kind, "Declared exchange");
        Ok(())
    }

    /// Declare a queue. An anonymous spec gets a broker-generated name,
    /// returned in `DeclaredQueue::name`.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue> {
        let declared = self
            .channel
            .declare_queue(spec)
            .await
            .inspect_err(|e| error!(queue = %spec.name, error = %e, "Failed to declare queue"))?;
        debug!(
            queue = %declared.name,
            durable = spec.durable,
            messages = declared.message_count,
            consumers = declared.consumer_count,
            "Declared queue"
        );
        Ok(declared)
    }

    /// Bind `queue` to `exchange` with a routing key or pattern. Queues are
    /// implicitly bound to the default exchange by name, so that case is
    /// skipped.
    pub async fn bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(());
        }
        self.channel
            .bind_queue(queue, routing_key, exchange)
            .await
            .inspect_err(|e| {
                error!(queue = %queue, exchange = %exchange, routing_key = %routing_key, error = %e, "Failed to bind queue")
            })?;
        debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue");
        Ok(())
    }

    /// Make sure a message published to `exchange` with `routing_key` lands
    /// in `queue`: declares the exchange and an ad hoc queue and binds them.
    /// An empty queue name declares only the exchange.
    pub async fn ensure_route(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        kind: ExchangeKind,
    ) -> Result<()> {
        self.declare_exchange(exchange, kind).await?;
        if queue.is_empty() {
            return Ok(());
        }
        let declared = self.declare_queue(&QueueSpec::new(queue)).await?;
        self.bind(&declared.name, routing_key, exchange).await
    }

    /// Declare a service's exchange and queue and bind every request and
    /// response key.
    pub async fn declare_binding(&self, binding: &QueueBinding) -> Result<DeclaredQueue> {
        self.declare_exchange(&binding.exchange, binding.exchange_kind)
            .await?;
        let declared = self.declare_queue(&QueueSpec::new(&binding.queue)).await?;
        for key in binding.all_routing_keys() {
            self.bind(&declared.name, key.as_str(), &binding.exchange)
                .await?;
        }
        Ok(declared)
    }
}
