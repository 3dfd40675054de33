//! Broker topology value types: exchanges, queues, ack modes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::BusError;

/// The nameless default exchange. Routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Broker pseudo-queue for direct reply-to RPC.
///
/// Consuming from it (in auto-ack mode) and publishing with `reply_to`
/// set to it makes the broker route replies straight back to the
/// consuming channel, without declaring a queue.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Exchange routing kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(BusError::config(format!("unknown exchange kind '{other}'"))),
        }
    }
}

/// Exchange declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl ExchangeSpec {
    /// Durable, non-internal exchange (the fixed declaration used everywhere).
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

/// A queue argument value (`x-message-ttl`, `x-dead-letter-exchange`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueArgument {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// Queue declaration parameters.
///
/// An empty name asks the broker to generate a unique one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, QueueArgument>,
}

impl QueueSpec {
    /// Ad hoc queue: non-durable, non-exclusive, not auto-deleted.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Long-lived named domain queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Default::default()
        }
    }

    /// Broker-named queue.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_arguments(mut self, arguments: BTreeMap<String, QueueArgument>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: QueueArgument) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// What the broker reported for a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// Resolved name (broker-generated for anonymous queues).
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Acknowledgement mode of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// The dispatcher acks or nacks after the handler completes or times out.
    Manual,
    /// The broker considers the message delivered as soon as it is sent.
    Auto,
}

impl AckMode {
    pub fn is_auto(&self) -> bool {
        matches!(self, AckMode::Auto)
    }
}
