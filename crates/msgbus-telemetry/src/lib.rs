//! # msgbus-telemetry
//!
//! Logging and metrics bootstrap for services built on `msgbus`.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` registry with `EnvFilter`, pretty or
//!   JSON output
//! - **Metrics**: Prometheus collectors named `msgbus_*` and a
//!   `PrometheusRecorder` that the bus client feeds
//!
//! ## Usage
//!
//! ```rust,ignore
//! use msgbus::{BusConfig, MessageBusClient};
//! use msgbus_telemetry::{init_telemetry, PrometheusRecorder, TelemetryConfig};
//! use std::sync::Arc;
//!
//! let _guard = init_telemetry(TelemetryConfig::from_env())?;
//! let client = MessageBusClient::with_metrics(
//!     BusConfig::from_env(),
//!     connector,
//!     Arc::new(PrometheusRecorder::new()),
//! );
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MSGBUS_SERVICE_NAME` | `msgbus` | Service name in logs |
//! | `MSGBUS_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` wins) |
//! | `MSGBUS_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `MSGBUS_JSON_LOGS` | `true` in containers | JSON log lines |
//! | `MSGBUS_METRICS` | `true` | Register Prometheus collectors |

mod config;
mod logging;
pub mod metrics;
mod recorder;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{encode_metrics, register_metrics, MetricsHandle};
pub use recorder::PrometheusRecorder;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Register metrics (when enabled) and install the log subscriber.
///
/// Hold the returned guard for the lifetime of the process.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = if config.metrics_enabled {
        Some(register_metrics()?)
    } else {
        None
    };

    init_logging(&config)?;

    Ok(TelemetryGuard {
        service_name: config.service_name,
        metrics,
    })
}

/// Keeps telemetry active; logs on drop.
pub struct TelemetryGuard {
    service_name: String,
    metrics: Option<MetricsHandle>,
}

impl TelemetryGuard {
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}
