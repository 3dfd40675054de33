//! Service layer: the bus operations, built on the broker ports.

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod publisher;
pub mod router;
pub mod rpc;
pub mod topology;

pub use client::MessageBusClient;
pub use connection::{ConnectionManager, ScopedChannel};
pub use dispatcher::{
    ConsumerDispatcher, DeliveryOutcome, Subscription, SubscriptionSpec, SubscriptionState,
};
pub use publisher::Publisher;
pub use router::EventRouter;
pub use rpc::{RpcRequester, RpcResponder};
pub use topology::TopologyManager;
