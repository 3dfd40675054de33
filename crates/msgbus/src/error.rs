//! Error types for the message bus client.
//!
//! Connectivity failures never surface from `ConnectionManager::connect`
//! (it retries forever); they only appear when an operation needs a live
//! connection and there is none. Handler timeouts, correlation mismatches
//! and RPC deadlines are outcomes, not errors (see `DeliveryOutcome` and
//! `RpcOutcome`).

use thiserror::Error;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced to callers of the bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Invalid client configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker unreachable or connection dropped.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// An operation was attempted before `connect()` succeeded.
    #[error("Connection is not initialized")]
    NotConnected,

    /// Opening, using or closing a logical channel failed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Declaring an exchange or queue, or binding, failed.
    #[error("Topology error: failed to {operation} '{target}': {reason}")]
    Topology {
        operation: &'static str,
        target: String,
        reason: String,
    },

    /// Publishing a message failed.
    #[error("Publish error on exchange '{exchange}' with key '{routing_key}': {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// Registering a consumer failed.
    #[error("Consume error on queue '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement error: {0}")]
    Ack(String),

    /// Payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The client or subscription was closed.
    #[error("Message bus client is closed")]
    Closed,
}

impl BusError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connectivity error
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a topology error
    pub fn topology(
        operation: &'static str,
        target: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Topology {
            operation,
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a publish error
    pub fn publish(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a consume error
    pub fn consume(queue: impl Into<String>, reason: impl ToString) -> Self {
        Self::Consume {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an acknowledgement error
    pub fn ack(msg: impl Into<String>) -> Self {
        Self::Ack(msg.into())
    }

    /// Whether the error means the connection itself is gone.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::NotConnected | Self::Closed)
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors returned by message handlers.
///
/// The dispatcher logs these but still acknowledges the delivery: only
/// completion versus deadline drives ack/nack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload could not be decoded.
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// The message was understood but refused.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The handler failed while processing.
    #[error("Handler failed: {0}")]
    Internal(String),
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
