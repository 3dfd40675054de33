//! Shared test fixtures.

use msgbus::{
    handler_fn, BusConfig, Delivery, HandlerError, InMemoryBroker, MessageBusClient,
    MessageHandler, Metrics, RoutingKey, RoutingKeyBuilder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connected client plus the broker and metrics behind it.
pub struct TestBus {
    pub broker: InMemoryBroker,
    pub client: Arc<MessageBusClient>,
    pub metrics: Arc<Metrics>,
}

impl TestBus {
    pub async fn new() -> Self {
        Self::with_config(BusConfig::default()).await
    }

    pub async fn with_config(config: BusConfig) -> Self {
        Self::on_broker(InMemoryBroker::new(), config).await
    }

    /// Another connected client on `broker`.
    pub async fn on_broker(broker: InMemoryBroker, config: BusConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(MessageBusClient::with_metrics(
            config,
            Arc::new(broker.clone()),
            metrics.clone(),
        ));
        client.connect().await.expect("in-memory broker accepts connections");
        Self {
            broker,
            client,
            metrics,
        }
    }
}

/// Base builder for the `acme` registry service.
pub fn registry_keys() -> RoutingKeyBuilder {
    RoutingKeyBuilder::new()
        .event()
        .cloud_source()
        .org("acme")
        .system("registry")
        .service("node")
}

pub fn pattern(pattern: &str) -> RoutingKey {
    RoutingKey::new(pattern)
}

/// Handler forwarding each delivery to a channel.
pub fn forwarding() -> (impl MessageHandler, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |delivery: Delivery, _| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(delivery);
            Ok::<(), HandlerError>(())
        }
    });
    (handler, rx)
}

/// Handler that sleeps for `delay` before completing, forwarding the
/// redelivered flag of each call.
pub fn sleeping(delay: Duration) -> (impl MessageHandler, mpsc::UnboundedReceiver<bool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |delivery: Delivery, _| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(delivery.redelivered);
            tokio::time::sleep(delay).await;
            Ok(())
        }
    });
    (handler, rx)
}
