//! Ports layer: trait seams between the bus services and the outside.

pub mod broker;
pub mod handler;

pub use broker::{
    Acker, AutoAcked, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream,
};
pub use handler::{handler_fn, FnHandler, MessageHandler};
