//! # msgbus
//!
//! Message-bus client shared by the services of the node network. Services
//! never call each other directly: they publish events on topic exchanges,
//! subscribe to routing-key patterns, and make RPC calls over the broker's
//! direct reply-to queue.
//!
//! ## Architecture
//!
//! - **Domain Layer** (`domain/`): Pure value types, no I/O
//!   - `RoutingKeyBuilder`: Dotted routing keys from their segments
//!   - `Envelope`, `RpcResult`: Message payloads and RPC outcomes
//!   - `ExchangeSpec`, `QueueSpec`: Topology descriptions
//!
//! - **Ports Layer** (`ports/`): Trait definitions
//!   - `BrokerConnector` / `BrokerConnection` / `BrokerChannel`: Driven ports
//!   - `MessageHandler`: Application callback for deliveries
//!
//! - **Service Layer** (`service/`): Orchestration
//!   - `ConnectionManager`: Connect with retry, scoped channels
//!   - `TopologyManager`: Idempotent declares and binds
//!   - `Publisher`, `RpcRequester`, `RpcResponder`
//!   - `ConsumerDispatcher`: Concurrent handlers, ack/nack by outcome
//!   - `MessageBusClient`: Facade over all of the above
//!
//! - **Adapters Layer** (`adapters/`): Broker implementations
//!   - `AmqpConnector`: RabbitMQ via lapin (feature `amqp`)
//!   - `InMemoryBroker`: Process-local broker for tests and local runs
//!
//! ## Delivery semantics
//!
//! Subscriptions consume with manual ack. Each delivery runs its handler on
//! its own task with a deadline (1s by default). A handler that returns in
//! time is acked, even when it returns an error. A handler that overruns is
//! nacked with requeue and the message is redelivered. Delivery is at least
//! once: handlers must be idempotent.
//!
//! ## Usage Example
//!
//! ```ignore
//! use msgbus::{handler_fn, BusConfig, ExchangeKind, MessageBusClient, RoutingKeyBuilder};
//!
//! let client = MessageBusClient::amqp(BusConfig::from_env());
//! client.connect().await?;
//!
//! let key = RoutingKeyBuilder::new()
//!     .event()
//!     .cloud_source()
//!     .local_scope()
//!     .org("acme")
//!     .system("registry")
//!     .service("node")
//!     .object("node")
//!     .action_create()
//!     .build()?;
//!
//! client
//!     .subscribe("audit", "node.events", ExchangeKind::Topic, &[key.clone()], "audit",
//!         handler_fn(|delivery, _deadline| async move {
//!             println!("{}", String::from_utf8_lossy(delivery.body()));
//!             Ok(())
//!         }))
//!     .await?;
//!
//! client.publish_json("node.events", &key, &serde_json::json!({"id": 1})).await?;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod service;

// Re-exports for convenience
pub use config::{BusConfig, QueueBinding};
pub use domain::{
    generate_token, new_correlation_id, topic_matches, AckMode, DeclaredQueue, Envelope,
    EventClass, ExchangeKind, ExchangeSpec, QueueArgument, QueueSpec, RoutingKey,
    RoutingKeyBuilder, RoutingKeyError, RpcOutcome, RpcResult, Scope, Source, CONTENT_TYPE_JSON,
    CONTENT_TYPE_TEXT, DEFAULT_EXCHANGE, DIRECT_REPLY_TO,
};
pub use error::{BusError, HandlerError, Result};
pub use metrics::{Metrics, MetricsRecorder, MetricsSnapshot, NoOpMetrics};
pub use ports::{
    handler_fn, Acker, BrokerChannel, BrokerConnection, BrokerConnector, Delivery,
    DeliveryStream, MessageHandler,
};
pub use service::{
    ConnectionManager, ConsumerDispatcher, DeliveryOutcome, EventRouter, MessageBusClient,
    Publisher, RpcRequester, RpcResponder, Subscription, SubscriptionSpec, SubscriptionState,
    TopologyManager,
};

pub use adapters::InMemoryBroker;
#[cfg(feature = "amqp")]
pub use adapters::AmqpConnector;
