//! Adapters layer: broker implementations of the outbound ports.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::InMemoryBroker;
