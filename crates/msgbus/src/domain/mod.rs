//! Domain layer: pure value types, no I/O.

pub mod correlation;
pub mod envelope;
pub mod routing_key;
pub mod topology;

pub use correlation::{generate_token, new_correlation_id, CORRELATION_ID_LEN};
pub use envelope::{Envelope, RpcOutcome, RpcResult, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT};
pub use routing_key::{
    topic_matches, EventClass, RoutingKey, RoutingKeyBuilder, RoutingKeyError, Scope, Source,
};
pub use topology::{
    AckMode, DeclaredQueue, ExchangeKind, ExchangeSpec, QueueArgument, QueueSpec,
    DEFAULT_EXCHANGE, DIRECT_REPLY_TO,
};
