//! # Publish/Subscribe Flows
//!
//! Topic routing from publisher to subscribers through the broker:
//!
//! 1. A message reaches exactly the queues whose patterns match its key
//! 2. Point-to-point sends through the default exchange
//! 3. JSON events on an existing exchange

#[cfg(test)]
mod tests {
    use msgbus::{BusError, ExchangeKind, RoutingKey};
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::fixtures::{forwarding, pattern, registry_keys, TestBus};

    // =============================================================================
    // TOPIC ROUTING
    // =============================================================================

    #[tokio::test]
    async fn test_topic_event_reaches_matching_subscriber_only() {
        let bus = TestBus::new().await;
        let (matching, mut matched) = forwarding();
        let (other, mut unmatched) = forwarding();

        bus.client
            .subscribe("qa", "E", ExchangeKind::Topic, &[pattern("a.b.*")], "qa", matching)
            .await
            .unwrap();
        bus.client
            .subscribe("qc", "E", ExchangeKind::Topic, &[pattern("a.c.*")], "qc", other)
            .await
            .unwrap();

        bus.client
            .publish(r#"{"x":1}"#, "", "E", &RoutingKey::new("a.b.create"), ExchangeKind::Topic)
            .await
            .unwrap();

        let delivery = timeout(Duration::from_secs(1), matched.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body(), br#"{"x":1}"#);
        assert_eq!(delivery.routing_key, "a.b.create");
        assert_eq!(delivery.envelope.content_type, None);

        assert!(timeout(Duration::from_millis(100), unmatched.recv())
            .await
            .is_err());
        assert_eq!(bus.broker.queue_depth("qc"), 0);
    }

    #[tokio::test]
    async fn test_each_queue_gets_its_own_copy() {
        let bus = TestBus::new().await;
        let (first, mut first_rx) = forwarding();
        let (second, mut second_rx) = forwarding();

        for (queue, handler) in [("audit", first), ("billing", second)] {
            bus.client
                .subscribe(queue, "E", ExchangeKind::Topic, &[pattern("a.#")], queue, handler)
                .await
                .unwrap();
        }

        bus.client
            .publish("x", "", "E", &RoutingKey::new("a.b.c"), ExchangeKind::Topic)
            .await
            .unwrap();

        assert_eq!(first_rx.recv().await.unwrap().body(), b"x");
        assert_eq!(second_rx.recv().await.unwrap().body(), b"x");
    }

    #[tokio::test]
    async fn test_builder_keys_route_through_wildcards() {
        let bus = TestBus::new().await;
        let (handler, mut rx) = forwarding();
        let create = registry_keys().object("node").action_create().must_build();

        bus.client
            .subscribe(
                "watch",
                "registry",
                ExchangeKind::Topic,
                &[pattern("event.cloud.*.registry.node.node.*")],
                "watch",
                handler,
            )
            .await
            .unwrap();
        bus.client
            .publish_json("registry", &create, &serde_json::json!({"id": 42}))
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "event.cloud.acme.registry.node.node.create");
        assert_eq!(
            delivery.envelope.content_type.as_deref(),
            Some("application/json")
        );
        let body: serde_json::Value = delivery.envelope.decode_json().unwrap();
        assert_eq!(body["id"], 42);
    }

    // =============================================================================
    // POINT-TO-POINT
    // =============================================================================

    #[tokio::test]
    async fn test_publish_on_queue_is_consumed_with_auto_ack() {
        let bus = TestBus::new().await;
        let (handler, mut rx) = forwarding();

        bus.client
            .subscribe_to_queue("notifications", "notify", handler)
            .await
            .unwrap();
        bus.client
            .publish_on_queue(r#"{"to":"ops"}"#, "notifications", true)
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body(), br#"{"to":"ops"}"#);
        assert_eq!(bus.broker.unacked_count("notifications"), 0);
    }

    #[tokio::test]
    async fn test_publish_json_on_missing_exchange_fails() {
        let bus = TestBus::new().await;

        let err = bus
            .client
            .publish_json("nowhere", &RoutingKey::new("a.b"), &[1, 2, 3])
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Publish { .. }));
        assert_eq!(bus.metrics.snapshot().publish_failures, 1);
    }
}
