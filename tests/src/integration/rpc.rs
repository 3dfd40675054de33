//! # RPC Flows
//!
//! Request/reply over the direct reply-to queue:
//!
//! 1. A request gets the reply carrying its correlation id
//! 2. Replies for other requests are discarded, not returned
//! 3. Requests end with `TimedOut` or `StreamClosed` instead of hanging

#[cfg(test)]
mod tests {
    use msgbus::{Delivery, ExchangeKind, MessageBusClient, RoutingKey, RpcOutcome};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    use crate::fixtures::TestBus;

    const SERVICE_QUEUE: &str = "health";

    fn key() -> RoutingKey {
        RoutingKey::new(SERVICE_QUEUE)
    }

    /// Serve `SERVICE_QUEUE`, answering each request with `answer`. With
    /// `stray` a reply with a foreign correlation id goes out first.
    async fn serve(bus: &TestBus, answer: &'static str, stray: bool) {
        let server: Arc<MessageBusClient> = bus.client.clone();
        bus.client
            .subscribe_to_queue(
                SERVICE_QUEUE,
                "server",
                msgbus::handler_fn(move |request: Delivery, _| {
                    let server = server.clone();
                    async move {
                        if stray {
                            let reply_to = request.reply_to().unwrap_or_default().to_string();
                            server.reply("stray", "not-your-request", &reply_to).await?;
                        }
                        server.respond(&request, answer).await?;
                        Ok::<(), msgbus::HandlerError>(())
                    }
                }),
            )
            .await
            .unwrap();
    }

    // =============================================================================
    // REPLIES
    // =============================================================================

    #[tokio::test]
    async fn test_ping_pong() {
        let bus = TestBus::new().await;
        serve(&bus, "pong", false).await;

        let result = bus
            .client
            .request("ping", SERVICE_QUEUE, "", &key(), ExchangeKind::Direct)
            .await
            .unwrap();

        assert!(result.succeeded());
        let reply = result.response().unwrap();
        assert_eq!(reply.body, b"pong");
        assert_eq!(reply.correlation_id.as_deref(), Some(result.correlation_id.as_str()));
        assert_eq!(reply.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_foreign_correlation_id_is_discarded() {
        let bus = TestBus::new().await;
        serve(&bus, "pong", true).await;

        let result = bus
            .client
            .request("ping", SERVICE_QUEUE, "", &key(), ExchangeKind::Direct)
            .await
            .unwrap();

        assert_eq!(result.response().unwrap().body, b"pong");
        assert_eq!(bus.metrics.snapshot().correlation_mismatches, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_replies() {
        let bus = TestBus::new().await;
        let server = bus.client.clone();
        bus.client
            .subscribe_to_queue(
                SERVICE_QUEUE,
                "echo",
                msgbus::handler_fn(move |request: Delivery, _| {
                    let server = server.clone();
                    async move {
                        let body = request.body().to_vec();
                        server.respond(&request, body).await?;
                        Ok::<(), msgbus::HandlerError>(())
                    }
                }),
            )
            .await
            .unwrap();

        let requests = (0..8).map(|i| {
            let client = bus.client.clone();
            async move {
                client
                    .request(format!("req-{i}"), SERVICE_QUEUE, "", &key(), ExchangeKind::Direct)
                    .await
                    .unwrap()
            }
        });
        let results = futures::future::join_all(requests).await;

        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.response().unwrap().body, format!("req-{i}").into_bytes());
        }
        assert_eq!(bus.broker.reply_consumer_count(), 0);
    }

    // =============================================================================
    // NO REPLY
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let bus = TestBus::new().await;
        let started = Instant::now();

        let result = bus
            .client
            .request_with_timeout(
                "ping",
                "nobody-listens",
                "",
                &RoutingKey::new("nobody-listens"),
                ExchangeKind::Direct,
                Duration::from_secs(3),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, RpcOutcome::TimedOut);
        assert!(result.response().is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(bus.metrics.snapshot().rpc_timed_out, 1);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_request() {
        let bus = TestBus::new().await;
        let client = bus.client.clone();
        let pending = tokio::spawn(async move {
            client
                .request_with_timeout(
                    "ping",
                    "nobody-listens",
                    "",
                    &RoutingKey::new("nobody-listens"),
                    ExchangeKind::Direct,
                    Duration::from_secs(3600),
                )
                .await
        });

        while bus.broker.reply_consumer_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.client.close().await.unwrap();

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result.outcome, RpcOutcome::StreamClosed);
    }
}
