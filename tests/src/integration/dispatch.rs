//! # Consumer Dispatch Flows
//!
//! Delivery settlement as seen from the broker:
//!
//! 1. Handlers that finish inside the 1s deadline are acked exactly once
//! 2. Handlers that overrun are nacked and the message is redelivered
//! 3. Service queues, queue arguments and close behaviour

#[cfg(test)]
mod tests {
    use msgbus::{
        handler_fn, BusError, ExchangeKind, HandlerError, QueueArgument, RoutingKey,
        SubscriptionState,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::fixtures::{forwarding, pattern, sleeping, TestBus};

    async fn publish(bus: &TestBus, key: &str) {
        bus.client
            .publish("x", "", "E", &RoutingKey::new(key), ExchangeKind::Topic)
            .await
            .unwrap();
    }

    // =============================================================================
    // DEADLINE BOUNDARY
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_handler_finishing_at_999ms_is_acked_once() {
        let bus = TestBus::new().await;
        let (handler, mut calls) = sleeping(Duration::from_millis(999));
        let sub = bus
            .client
            .subscribe("jobs", "E", ExchangeKind::Topic, &[pattern("job.#")], "w", handler)
            .await
            .unwrap();

        publish(&bus, "job.run").await;
        assert_eq!(calls.recv().await, Some(false));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(calls.try_recv().is_err());
        assert_eq!(bus.broker.queue_depth("jobs"), 0);
        assert_eq!(bus.broker.unacked_count("jobs"), 0);
        assert_eq!(bus.metrics.snapshot().acked, 1);
        assert_eq!(bus.metrics.snapshot().handler_timeouts, 0);
        sub.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_finishing_at_1001ms_is_redelivered() {
        let bus = TestBus::new().await;
        let (handler, mut calls) = sleeping(Duration::from_millis(1001));
        let sub = bus
            .client
            .subscribe("jobs", "E", ExchangeKind::Topic, &[pattern("job.#")], "w", handler)
            .await
            .unwrap();

        publish(&bus, "job.run").await;

        assert_eq!(calls.recv().await, Some(false));
        assert_eq!(calls.recv().await, Some(true));
        let snapshot = bus.metrics.snapshot();
        assert!(snapshot.handler_timeouts >= 1);
        assert!(snapshot.nacked_requeued >= 1);
        assert_eq!(snapshot.acked, 0);
        sub.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_that_never_returns_is_redelivered() {
        let bus = TestBus::new().await;
        let (tx, mut calls) = tokio::sync::mpsc::unbounded_channel();
        let handler = handler_fn(move |delivery: msgbus::Delivery, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery.redelivered);
                std::future::pending::<()>().await;
                Ok(())
            }
        });
        let sub = bus
            .client
            .subscribe("jobs", "E", ExchangeKind::Topic, &[pattern("job.#")], "w", handler)
            .await
            .unwrap();

        publish(&bus, "job.stuck").await;

        assert_eq!(calls.recv().await, Some(false));
        assert_eq!(calls.recv().await, Some(true));
        sub.close().await.unwrap();
        assert_eq!(sub.state(), SubscriptionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_is_still_acked() {
        let bus = TestBus::new().await;
        let handler = handler_fn(|_, _| async { Err(HandlerError::Rejected("unknown node".into())) });
        let sub = bus
            .client
            .subscribe("jobs", "E", ExchangeKind::Topic, &[pattern("job.#")], "w", handler)
            .await
            .unwrap();

        publish(&bus, "job.run").await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(bus.metrics.snapshot().acked, 1);
        assert_eq!(bus.broker.queue_depth("jobs"), 0);
        sub.close().await.unwrap();
    }

    // =============================================================================
    // SUBSCRIPTION VARIANTS
    // =============================================================================

    #[tokio::test]
    async fn test_service_queue_needs_existing_exchange() {
        let bus = TestBus::new().await;
        let keys = [pattern("event.cloud.*.registry.#")];

        let (handler, _rx) = forwarding();
        let err = bus
            .client
            .subscribe_to_service_queue("registry", "events", &keys, "registry", handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Topology { .. }));

        bus.client
            .publish("x", "", "events", &RoutingKey::new("boot"), ExchangeKind::Topic)
            .await
            .unwrap();
        let (handler, mut rx) = forwarding();
        bus.client
            .subscribe_to_service_queue("registry", "events", &keys, "registry", handler)
            .await
            .unwrap();

        assert!(bus.broker.queue_spec("registry").unwrap().durable);
        bus.client
            .publish(
                "y",
                "",
                "events",
                &RoutingKey::new("event.cloud.acme.registry.node.node.create"),
                ExchangeKind::Topic,
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().body(), b"y");
    }

    #[tokio::test]
    async fn test_subscribe_with_queue_arguments() {
        let bus = TestBus::new().await;
        let mut arguments = BTreeMap::new();
        arguments.insert("x-message-ttl".to_string(), QueueArgument::Int(60_000));
        arguments.insert(
            "x-dead-letter-exchange".to_string(),
            QueueArgument::Str("dlx".into()),
        );
        let (handler, _rx) = forwarding();

        bus.client
            .subscribe_with_args("ttl", "E", ExchangeKind::Topic, &[], "ttl", arguments.clone(), handler)
            .await
            .unwrap();

        assert_eq!(bus.broker.queue_spec("ttl").unwrap().arguments, arguments);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_in_flight_handler() {
        let bus = TestBus::new().await;
        let (handler, mut calls) = sleeping(Duration::from_millis(500));
        let sub = bus
            .client
            .subscribe("jobs", "E", ExchangeKind::Topic, &[pattern("job.#")], "w", handler)
            .await
            .unwrap();

        publish(&bus, "job.run").await;
        assert_eq!(calls.recv().await, Some(false));
        timeout(Duration::from_secs(10), sub.close())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(bus.metrics.snapshot().acked, 1);
        assert_eq!(bus.broker.consumer_count("jobs"), 0);
    }
}
