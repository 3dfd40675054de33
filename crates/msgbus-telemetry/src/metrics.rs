//! Prometheus metrics for the message bus.
//!
//! All metrics follow the naming convention: `msgbus_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Connection attempts, published messages, settled deliveries
//! - **Histogram**: RPC round-trip latency

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // CONNECTION METRICS
    // =========================================================================

    /// Failed connection attempts (each is retried)
    pub static ref CONNECT_FAILURES: Counter = Counter::new(
        "msgbus_connect_failures_total",
        "Broker connection attempts that failed"
    ).expect("metric creation failed");

    /// Established connections
    pub static ref CONNECTIONS: Counter = Counter::new(
        "msgbus_connections_total",
        "Broker connections established"
    ).expect("metric creation failed");

    // =========================================================================
    // PUBLISH METRICS
    // =========================================================================

    /// Messages published, by exchange
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("msgbus_messages_published_total", "Messages published"),
        &["exchange"]
    ).expect("metric creation failed");

    /// Failed publishes, by exchange
    pub static ref PUBLISH_FAILURES: CounterVec = CounterVec::new(
        Opts::new("msgbus_publish_failures_total", "Publishes the broker refused"),
        &["exchange"]
    ).expect("metric creation failed");

    // =========================================================================
    // CONSUMER METRICS
    // =========================================================================

    /// Settled deliveries
    pub static ref DELIVERIES_SETTLED: CounterVec = CounterVec::new(
        Opts::new("msgbus_deliveries_settled_total", "Deliveries acked or nacked"),
        &["queue", "outcome"]  // outcome: acked/requeued/dropped
    ).expect("metric creation failed");

    /// Handlers that missed their deadline
    pub static ref HANDLER_TIMEOUTS: CounterVec = CounterVec::new(
        Opts::new("msgbus_handler_timeouts_total", "Handlers still running at their deadline"),
        &["queue"]
    ).expect("metric creation failed");

    // =========================================================================
    // RPC METRICS
    // =========================================================================

    /// RPC round trips
    pub static ref RPC_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "msgbus_rpc_duration_seconds",
            "Time from request publish to reply, stream close or deadline"
        ).buckets(exponential_buckets(0.001, 2.0, 16).expect("valid bucket layout")),
        &["outcome"]  // outcome: replied/stream_closed/timed_out
    ).expect("metric creation failed");

    /// Replies discarded for carrying another request's correlation id
    pub static ref CORRELATION_MISMATCHES: Counter = Counter::new(
        "msgbus_rpc_correlation_mismatches_total",
        "Replies discarded for a foreign correlation id"
    ).expect("metric creation failed");
}

/// Proof that the collectors are registered.
#[derive(Debug, Clone, Copy)]
pub struct MetricsHandle {
    _private: (),
}

/// Register every collector with `REGISTRY`. Calling it again is a no-op.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CONNECT_FAILURES.clone()),
        Box::new(CONNECTIONS.clone()),
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        Box::new(DELIVERIES_SETTLED.clone()),
        Box::new(HANDLER_TIMEOUTS.clone()),
        Box::new(RPC_DURATION.clone()),
        Box::new(CORRELATION_MISMATCHES.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle { _private: () })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
