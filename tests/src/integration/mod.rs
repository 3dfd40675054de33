//! Cross-component flows.

pub mod connection;
pub mod dispatch;
pub mod pubsub;
pub mod rpc;
pub mod topology;
