//! Message envelopes and RPC results.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::routing_key::RoutingKey;
use crate::error::BusError;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// The wire-level message: an opaque body plus the few properties the bus
/// uses. The bus never interprets `body`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl Envelope {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Serialize `value` as a JSON envelope.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, BusError> {
        Ok(Self::new(serde_json::to_vec(value)?).with_content_type(CONTENT_TYPE_JSON))
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Decode the body as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Whether this envelope carries `correlation_id`.
    pub fn correlates_with(&self, correlation_id: &str) -> bool {
        self.correlation_id.as_deref() == Some(correlation_id)
    }
}

/// How an RPC request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcOutcome {
    /// A reply carrying the request's correlation id arrived.
    Replied(Envelope),
    /// The reply stream ended before a matching reply arrived.
    StreamClosed,
    /// The deadline passed before a matching reply arrived.
    TimedOut,
}

impl RpcOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RpcOutcome::Replied(_) => "replied",
            RpcOutcome::StreamClosed => "stream_closed",
            RpcOutcome::TimedOut => "timed_out",
        }
    }
}

/// Result of one `request()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub routing_key: RoutingKey,
    pub correlation_id: String,
    pub outcome: RpcOutcome,
}

impl RpcResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Replied(_))
    }

    pub fn response(&self) -> Option<&Envelope> {
        match &self.outcome {
            RpcOutcome::Replied(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Envelope> {
        match self.outcome {
            RpcOutcome::Replied(envelope) => Some(envelope),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct NodeState {
        node_id: String,
        online: bool,
    }

    #[test]
    fn test_json_envelope() {
        let state = NodeState {
            node_id: "uk-sa2341-hnode-v0-a1a0".to_string(),
            online: true,
        };
        let envelope = Envelope::json(&state).unwrap();
        assert_eq!(envelope.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(envelope.decode_json::<NodeState>().unwrap(), state);
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let envelope = Envelope::new(b"not json".to_vec());
        let err = envelope.decode_json::<NodeState>().unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[test]
    fn test_correlates_with() {
        let envelope = Envelope::new("pong").with_correlation_id("ABC");
        assert!(envelope.correlates_with("ABC"));
        assert!(!envelope.correlates_with("ABD"));
        assert!(!Envelope::new("pong").correlates_with("ABC"));
    }

    #[test]
    fn test_rpc_result_accessors() {
        let replied = RpcResult {
            routing_key: RoutingKey::from("request.cloud.acme.node.health.node.ping"),
            correlation_id: "X".to_string(),
            outcome: RpcOutcome::Replied(Envelope::new("pong")),
        };
        assert!(replied.succeeded());
        assert_eq!(replied.response().map(|e| e.body.as_slice()), Some(&b"pong"[..]));

        let timed_out = RpcResult {
            outcome: RpcOutcome::TimedOut,
            ..replied
        };
        assert!(!timed_out.succeeded());
        assert!(timed_out.into_response().is_none());
    }
}
