//! # Topology Flows
//!
//! Declarations are idempotent: repeating an operation never duplicates
//! exchanges, queues or bindings, and conflicting redeclarations fail.

#[cfg(test)]
mod tests {
    use msgbus::{BusError, ExchangeKind, QueueBinding, RoutingKey};
    use proptest::prelude::*;

    use crate::fixtures::{registry_keys, TestBus};

    #[tokio::test]
    async fn test_repeated_publish_declares_once() {
        let bus = TestBus::new().await;
        let key = RoutingKey::new("a.b.create");

        for _ in 0..3 {
            bus.client
                .publish("x", "audit", "E", &key, ExchangeKind::Topic)
                .await
                .unwrap();
        }

        assert_eq!(bus.broker.exchange_count(), 1);
        assert_eq!(bus.broker.queue_count(), 1);
        assert_eq!(bus.broker.binding_count(), 1);
        assert_eq!(bus.broker.queue_depth("audit"), 3);
    }

    #[tokio::test]
    async fn test_conflicting_exchange_kind_is_rejected() {
        let bus = TestBus::new().await;
        let key = RoutingKey::new("a");
        bus.client
            .publish("x", "", "E", &key, ExchangeKind::Topic)
            .await
            .unwrap();

        let err = bus
            .client
            .publish("x", "", "E", &key, ExchangeKind::Fanout)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Topology { .. }));
    }

    #[tokio::test]
    async fn test_binding_declared_twice() {
        let bus = TestBus::new().await;
        let keys = registry_keys().object("node");
        let binding = QueueBinding::new("registry", "registry-node")
            .with_request_keys([keys.clone().request().action_create().must_build()])
            .with_response_keys([keys.response().action_create().must_build()]);

        bus.client.declare_binding(&binding).await.unwrap();
        bus.client.declare_binding(&binding).await.unwrap();

        assert_eq!(bus.broker.binding_count(), 2);
        assert!(bus.broker.is_bound(
            "registry-node",
            "registry",
            "request.cloud.acme.registry.node.node.create"
        ));
    }

    #[tokio::test]
    async fn test_anonymous_queues_are_unique() {
        let bus = TestBus::new().await;

        let first = bus.client.declare_queue("", false).await.unwrap();
        let second = bus.client.declare_queue("", false).await.unwrap();

        assert_ne!(first.name, second.name);
        assert_eq!(bus.broker.queue_count(), 2);
    }

    proptest! {
        #[test]
        fn prop_builder_keys_match_their_own_wildcards(
            object in "[a-z]{1,8}",
            action in "[a-z]{1,8}",
        ) {
            let key = registry_keys().object(object.as_str()).action(action.as_str()).must_build();
            let exact = format!("event.cloud.acme.registry.node.{object}.{action}");
            let any_action = format!("event.cloud.acme.registry.node.{object}.*");
            prop_assert!(key.matches(&exact));
            prop_assert!(key.matches(&any_action));
            prop_assert!(key.matches("event.#"));
            prop_assert!(!key.matches("request.#"));
        }
    }
}
