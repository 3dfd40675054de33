//! `MetricsRecorder` backed by the Prometheus collectors.

use msgbus::{MetricsRecorder, RpcOutcome};
use std::time::Duration;

use crate::metrics::{
    CONNECTIONS, CONNECT_FAILURES, CORRELATION_MISMATCHES, DELIVERIES_SETTLED, HANDLER_TIMEOUTS,
    MESSAGES_PUBLISHED, PUBLISH_FAILURES, RPC_DURATION,
};

/// Feeds bus events into the global registry. Pass it to
/// `MessageBusClient::with_metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusRecorder;

impl PrometheusRecorder {
    pub fn new() -> Self {
        Self
    }
}

// The default exchange has an empty name.
fn exchange_label(exchange: &str) -> &str {
    if exchange.is_empty() {
        "default"
    } else {
        exchange
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn record_connect_failure(&self) {
        CONNECT_FAILURES.inc();
    }

    fn record_connected(&self) {
        CONNECTIONS.inc();
    }

    fn record_published(&self, exchange: &str) {
        MESSAGES_PUBLISHED
            .with_label_values(&[exchange_label(exchange)])
            .inc();
    }

    fn record_publish_failure(&self, exchange: &str) {
        PUBLISH_FAILURES
            .with_label_values(&[exchange_label(exchange)])
            .inc();
    }

    fn record_acked(&self, queue: &str) {
        DELIVERIES_SETTLED.with_label_values(&[queue, "acked"]).inc();
    }

    fn record_nacked(&self, queue: &str, requeue: bool) {
        let outcome = if requeue { "requeued" } else { "dropped" };
        DELIVERIES_SETTLED.with_label_values(&[queue, outcome]).inc();
    }

    fn record_handler_timeout(&self, queue: &str) {
        HANDLER_TIMEOUTS.with_label_values(&[queue]).inc();
    }

    fn record_rpc(&self, outcome: &RpcOutcome, elapsed: Duration) {
        RPC_DURATION
            .with_label_values(&[outcome.label()])
            .observe(elapsed.as_secs_f64());
    }

    fn record_correlation_mismatch(&self) {
        CORRELATION_MISMATCHES.inc();
    }
}
