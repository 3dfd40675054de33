//! # MessageBusClient
//!
//! The facade services use. It owns one `ConnectionManager` and wires the
//! publisher, RPC pair and consumer dispatcher to it. Subscriptions opened
//! through the client are closed by `MessageBusClient::close`.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{BusConfig, QueueBinding};
use crate::domain::{
    generate_token, DeclaredQueue, ExchangeKind, QueueArgument, QueueSpec, RoutingKey, RpcResult,
};
use crate::error::Result;
use crate::metrics::{MetricsRecorder, NoOpMetrics};
use crate::ports::{BrokerConnector, Delivery, MessageHandler};
use crate::service::connection::ConnectionManager;
use crate::service::dispatcher::{
    ConsumerDispatcher, Subscription, SubscriptionSpec, SubscriptionState,
};
use crate::service::publisher::Publisher;
use crate::service::rpc::{RpcRequester, RpcResponder};
use crate::service::topology::TopologyManager;

/// Message bus client.
pub struct MessageBusClient {
    config: Arc<BusConfig>,
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    requester: RpcRequester,
    responder: RpcResponder,
    dispatcher: ConsumerDispatcher,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
}

impl MessageBusClient {
    pub fn new(config: BusConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self::with_metrics(config, connector, Arc::new(NoOpMetrics))
    }

    pub fn with_metrics(
        config: BusConfig,
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let config = Arc::new(config);
        let connection = Arc::new(ConnectionManager::new(
            config.clone(),
            connector,
            metrics.clone(),
        ));
        Self {
            publisher: Publisher::new(connection.clone(), metrics.clone()),
            requester: RpcRequester::new(connection.clone(), metrics.clone()),
            responder: RpcResponder::new(connection.clone(), metrics.clone()),
            dispatcher: ConsumerDispatcher::new(connection.clone(), metrics),
            config,
            connection,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Client talking AMQP to the configured broker.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: BusConfig) -> Self {
        let connector = crate::adapters::AmqpConnector::new()
            .with_connection_name(config.connection_name.clone());
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Block until the broker accepts a connection. See
    /// `ConnectionManager::connect`.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Declare `exchange` and `queue`, bind them, and publish `body`.
    pub async fn publish(
        &self,
        body: impl Into<Vec<u8>>,
        queue: &str,
        exchange: &str,
        routing_key: &RoutingKey,
        kind: ExchangeKind,
    ) -> Result<()> {
        self.publisher
            .publish(body, queue, exchange, routing_key.as_str(), kind)
            .await
    }

    /// Send `body` straight to `queue` through the default exchange.
    pub async fn publish_on_queue(
        &self,
        body: impl Into<Vec<u8>>,
        queue: &str,
        init_queue: bool,
    ) -> Result<()> {
        self.publisher.publish_on_queue(body, queue, init_queue).await
    }

    /// Publish `value` as JSON on an existing exchange.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &RoutingKey,
        value: &T,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publisher
            .publish_json(exchange, routing_key.as_str(), value)
            .await
    }

    /// RPC with the configured default deadline.
    pub async fn request(
        &self,
        body: impl Into<Vec<u8>>,
        queue: &str,
        exchange: &str,
        routing_key: &RoutingKey,
        kind: ExchangeKind,
    ) -> Result<RpcResult> {
        let timeout = self.config.rpc_timeout;
        self.request_with_timeout(body, queue, exchange, routing_key, kind, timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        body: impl Into<Vec<u8>>,
        queue: &str,
        exchange: &str,
        routing_key: &RoutingKey,
        kind: ExchangeKind,
        timeout: Duration,
    ) -> Result<RpcResult> {
        self.requester
            .request(body, queue, exchange, routing_key.as_str(), kind, timeout)
            .await
    }

    /// Answer an RPC: publish to `destination` echoing `correlation_id`.
    pub async fn reply(
        &self,
        body: impl Into<Vec<u8>>,
        correlation_id: &str,
        destination: &str,
    ) -> Result<()> {
        self.responder.reply(body, correlation_id, destination).await
    }

    /// Answer `request` at its reply-to address.
    pub async fn respond(&self, request: &Delivery, body: impl Into<Vec<u8>>) -> Result<()> {
        self.responder.respond(request, body).await
    }

    /// Subscribe `queue` to `routing_keys` on `exchange`. Deliveries are
    /// acknowledged after the handler returns, requeued if it overruns.
    pub async fn subscribe(
        &self,
        queue: &str,
        exchange: &str,
        kind: ExchangeKind,
        routing_keys: &[RoutingKey],
        consumer_tag: &str,
        handler: impl MessageHandler,
    ) -> Result<Arc<Subscription>> {
        let spec = SubscriptionSpec::bound(
            queue,
            exchange,
            kind,
            routing_keys.iter().cloned(),
            consumer_tag,
        );
        self.subscribe_spec(spec, handler).await
    }

    /// Like `subscribe`, with extra queue arguments.
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe_with_args(
        &self,
        queue: &str,
        exchange: &str,
        kind: ExchangeKind,
        routing_keys: &[RoutingKey],
        consumer_tag: &str,
        arguments: BTreeMap<String, QueueArgument>,
        handler: impl MessageHandler,
    ) -> Result<Arc<Subscription>> {
        let mut spec = SubscriptionSpec::bound(
            queue,
            exchange,
            kind,
            routing_keys.iter().cloned(),
            consumer_tag,
        );
        spec.queue = spec.queue.with_arguments(arguments);
        self.subscribe_spec(spec, handler).await
    }

    /// Consume the durable queue named after `service`, bound on an
    /// existing exchange.
    pub async fn subscribe_to_service_queue(
        &self,
        service: &str,
        exchange: &str,
        routing_keys: &[RoutingKey],
        consumer_tag: &str,
        handler: impl MessageHandler,
    ) -> Result<Arc<Subscription>> {
        let spec = SubscriptionSpec::service_queue(
            service,
            exchange,
            routing_keys.iter().cloned(),
            consumer_tag,
        );
        self.subscribe_spec(spec, handler).await
    }

    /// Consume `queue` with auto ack: messages are settled on delivery
    /// whatever the handler does.
    pub async fn subscribe_to_queue(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: impl MessageHandler,
    ) -> Result<Arc<Subscription>> {
        self.subscribe_spec(SubscriptionSpec::queue(queue, consumer_tag), handler)
            .await
    }

    pub async fn subscribe_spec(
        &self,
        spec: SubscriptionSpec,
        handler: impl MessageHandler,
    ) -> Result<Arc<Subscription>> {
        let subscription = Arc::new(self.dispatcher.subscribe(spec, Arc::new(handler)).await?);
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|s| s.state() != SubscriptionState::Closed);
        subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    /// Declare a queue on its own channel.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<DeclaredQueue> {
        let channel = self.connection.acquire_channel().await?;
        let result = TopologyManager::new(&*channel)
            .declare_queue(&QueueSpec::new(name).with_durable(durable))
            .await;
        channel.release().await;
        result
    }

    /// Declare a service's exchange and queue with all of its bindings.
    pub async fn declare_binding(&self, binding: &QueueBinding) -> Result<DeclaredQueue> {
        let channel = self.connection.acquire_channel().await?;
        let result = TopologyManager::new(&*channel).declare_binding(binding).await;
        channel.release().await;
        result
    }

    /// Random 64-bit token.
    pub fn generate_token(&self) -> u64 {
        generate_token()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Close every subscription, then the connection. Safe to call more
    /// than once.
    pub async fn close(&self) -> Result<()> {
        let subscriptions: Vec<_> = self.subscriptions.lock().drain(..).collect();
        for subscription in &subscriptions {
            subscription.close().await?;
        }
        if !subscriptions.is_empty() {
            info!(count = subscriptions.len(), "Closed subscriptions");
        }
        self.connection.close().await
    }
}
