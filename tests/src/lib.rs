//! # Message Bus Test Suite
//!
//! End-to-end flows of `MessageBusClient` against `InMemoryBroker`.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs       # Clients, handlers and keys shared by the flows
//! └── integration/
//!     ├── pubsub.rs     # Topic routing, queue publishing, JSON events
//!     ├── rpc.rs        # Request/reply, correlation, timeouts
//!     ├── dispatch.rs   # Handler deadlines, ack/nack, redelivery
//!     ├── connection.rs # Retry, connection loss, close
//!     └── topology.rs   # Idempotent declares, bindings
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p msgbus-tests
//! cargo test -p msgbus-tests integration::rpc::
//! ```

pub mod fixtures;
pub mod integration;
