//! # Connection Flows
//!
//! Connecting with retry, losing the broker, and closing the client.

#[cfg(test)]
mod tests {
    use msgbus::{BusConfig, BusError, ExchangeKind, InMemoryBroker, MessageBusClient, RoutingKey};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    use crate::fixtures::{forwarding, pattern, TestBus};

    fn client(broker: &InMemoryBroker) -> Arc<MessageBusClient> {
        Arc::new(MessageBusClient::new(
            BusConfig::default(),
            Arc::new(broker.clone()),
        ))
    }

    // =============================================================================
    // RETRY
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_retries_every_five_seconds_until_reachable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let client = client(&broker);
        let started = Instant::now();

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(broker.connect_attempts(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.connect_attempts(), 2);

        broker.set_reachable(true);
        connecting.await.unwrap().unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_retrying_ends_connect() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let client = client(&broker);

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        client.close().await.unwrap();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(BusError::Closed)));
    }

    // =============================================================================
    // CONNECTION LOSS
    // =============================================================================

    #[tokio::test]
    async fn test_connection_loss_then_reconnect() {
        let bus = TestBus::new().await;
        let (handler, _rx) = forwarding();
        let sub = bus
            .client
            .subscribe("q", "E", ExchangeKind::Topic, &[pattern("#")], "q", handler)
            .await
            .unwrap();

        bus.broker.drop_connections();
        sub.closed().await;

        assert!(bus.client.is_closed());
        let err = bus
            .client
            .publish("x", "", "E", &RoutingKey::new("a"), ExchangeKind::Topic)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());

        bus.client.connect().await.unwrap();
        bus.client
            .publish("x", "", "E", &RoutingKey::new("a"), ExchangeKind::Topic)
            .await
            .unwrap();
        assert_eq!(bus.broker.queue_depth("q"), 1);
    }

    // =============================================================================
    // CLOSE
    // =============================================================================

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let bus = TestBus::new().await;
        bus.client.close().await.unwrap();
        bus.client.close().await.unwrap();

        assert!(bus.client.is_closed());
        assert_eq!(bus.broker.open_connections(), 0);
        assert!(matches!(
            bus.client.declare_queue("q", false).await,
            Err(BusError::Closed)
        ));
        assert!(matches!(bus.client.connect().await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);

        assert!(matches!(
            client.publish_on_queue("x", "q", true).await,
            Err(BusError::NotConnected)
        ));
    }
}
