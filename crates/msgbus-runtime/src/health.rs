//! Health-check RPC.
//!
//! Every service answers `request.cloud.<org>.<system>.<service>.health.ping`
//! with `pong` at the caller's reply-to address.

use async_trait::async_trait;
use msgbus::{
    Delivery, HandlerError, MessageBusClient, MessageHandler, RoutingKey, RoutingKeyBuilder,
    RoutingKeyError,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Body of every health reply.
pub const HEALTH_REPLY: &str = "pong";

/// Key a service's health requests are published with.
pub fn health_routing_key(
    org: &str,
    system: &str,
    service: &str,
) -> Result<RoutingKey, RoutingKeyError> {
    RoutingKeyBuilder::new()
        .request()
        .cloud_source()
        .org(org)
        .system(system)
        .service(service)
        .object("health")
        .action("ping")
        .build()
}

/// Replies `pong` to health requests.
pub struct HealthResponder {
    client: Arc<MessageBusClient>,
}

impl HealthResponder {
    pub fn new(client: Arc<MessageBusClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageHandler for HealthResponder {
    async fn handle(&self, delivery: Delivery, _deadline: Instant) -> Result<(), HandlerError> {
        debug!(correlation_id = ?delivery.correlation_id(), "Health check");
        self.client.respond(&delivery, HEALTH_REPLY).await?;
        Ok(())
    }
}
