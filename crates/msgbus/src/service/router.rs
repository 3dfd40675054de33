//! Routing-key based handler selection.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::domain::topic_matches;
use crate::error::HandlerError;
use crate::ports::{Delivery, MessageHandler};

/// Dispatches each delivery to the first handler whose topic pattern
/// matches its routing key.
///
/// Services bind one queue to many keys and register one handler per
/// event. Deliveries no pattern matches are logged and completed.
///
/// ```
/// use msgbus::{handler_fn, EventRouter};
///
/// let router = EventRouter::new()
///     .route("event.cloud.*.registry.node.node.create", handler_fn(|_, _| async { Ok(()) }))
///     .route("event.cloud.*.registry.node.#", handler_fn(|_, _| async { Ok(()) }));
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default, Clone)]
pub struct EventRouter {
    routes: Vec<(String, Arc<dyn MessageHandler>)>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for keys matching `pattern`. Earlier routes win.
    pub fn route(self, pattern: impl AsRef<str>, handler: impl MessageHandler) -> Self {
        self.route_shared(pattern, Arc::new(handler))
    }

    pub fn route_shared(mut self, pattern: impl AsRef<str>, handler: Arc<dyn MessageHandler>) -> Self {
        self.routes.push((pattern.as_ref().to_string(), handler));
        self
    }

    /// Handler for keys no route matches.
    pub fn fallback(mut self, handler: impl MessageHandler) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(p, _)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn select(&self, routing_key: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.routes
            .iter()
            .find(|(pattern, _)| topic_matches(pattern, routing_key))
            .map(|(pattern, handler)| {
                trace!(routing_key = %routing_key, pattern = %pattern, "Route matched");
                handler
            })
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl MessageHandler for EventRouter {
    async fn handle(&self, delivery: Delivery, deadline: Instant) -> Result<(), HandlerError> {
        match self.select(&delivery.routing_key) {
            Some(handler) => handler.handle(delivery, deadline).await,
            None => {
                warn!(routing_key = %delivery.routing_key, "No handler registered for routing key");
                Ok(())
            }
        }
    }
}
