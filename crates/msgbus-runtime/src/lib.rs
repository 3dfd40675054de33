//! # Service Runtime Library
//!
//! Hosting for services built on `msgbus`. The `msgbus-node` binary wires
//! these pieces together; services embedding the runtime use them directly.
//!
//! - `config`: `RuntimeConfig` from the environment
//! - `health`: health-check RPC responder
//! - `runtime`: `ServiceRuntime` lifecycle

pub mod config;
pub mod health;
pub mod runtime;

pub use config::{ConfigError, RuntimeConfig, DEFAULT_EXCHANGE};
pub use health::{health_routing_key, HealthResponder, HEALTH_REPLY};
pub use runtime::ServiceRuntime;
