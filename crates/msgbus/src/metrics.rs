//! Metrics hooks for bus operations
//!
//! The services record through `MetricsRecorder`. `Metrics` keeps atomic
//! counters in-process; `msgbus-telemetry` provides a Prometheus-backed
//! recorder.
//!
//! ## Usage
//!
//! ```ignore
//! use msgbus::metrics::{Metrics, MetricsRecorder};
//!
//! let metrics = Arc::new(Metrics::new());
//! let client = MessageBusClient::new(config, connector).with_metrics(metrics.clone());
//! // ...
//! println!("{:?}", metrics.snapshot());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::domain::RpcOutcome;

/// Trait for custom metrics recording implementations
pub trait MetricsRecorder: Send + Sync {
    /// A connection attempt failed and will be retried.
    fn record_connect_failure(&self);

    /// A connection was established.
    fn record_connected(&self);

    /// A message left the client.
    fn record_published(&self, exchange: &str);

    /// A publish failed.
    fn record_publish_failure(&self, exchange: &str);

    /// A delivery was acknowledged after its handler completed.
    fn record_acked(&self, queue: &str);

    /// A delivery was negatively acknowledged.
    fn record_nacked(&self, queue: &str, requeue: bool);

    /// A handler missed its deadline.
    fn record_handler_timeout(&self, queue: &str);

    /// An RPC request finished.
    fn record_rpc(&self, outcome: &RpcOutcome, elapsed: Duration);

    /// A reply with a foreign correlation id was discarded.
    fn record_correlation_mismatch(&self);
}

/// No-op metrics recorder (for when metrics are disabled)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl MetricsRecorder for NoOpMetrics {
    fn record_connect_failure(&self) {}
    fn record_connected(&self) {}
    fn record_published(&self, _: &str) {}
    fn record_publish_failure(&self, _: &str) {}
    fn record_acked(&self, _: &str) {}
    fn record_nacked(&self, _: &str, _: bool) {}
    fn record_handler_timeout(&self, _: &str) {}
    fn record_rpc(&self, _: &RpcOutcome, _: Duration) {}
    fn record_correlation_mismatch(&self) {}
}

/// In-process metrics collector
#[derive(Debug, Default)]
pub struct Metrics {
    pub connect_failures: AtomicU64,
    pub connections: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub acked: AtomicU64,
    pub nacked_requeued: AtomicU64,
    pub nacked_dropped: AtomicU64,
    pub handler_timeouts: AtomicU64,
    pub rpc_replied: AtomicU64,
    pub rpc_stream_closed: AtomicU64,
    pub rpc_timed_out: AtomicU64,
    pub correlation_mismatches: AtomicU64,
    /// Cumulative RPC latency in nanoseconds
    pub rpc_time_ns: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked_requeued: self.nacked_requeued.load(Ordering::Relaxed),
            nacked_dropped: self.nacked_dropped.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            rpc_replied: self.rpc_replied.load(Ordering::Relaxed),
            rpc_stream_closed: self.rpc_stream_closed.load(Ordering::Relaxed),
            rpc_timed_out: self.rpc_timed_out.load(Ordering::Relaxed),
            correlation_mismatches: self.correlation_mismatches.load(Ordering::Relaxed),
            avg_rpc_ns: self.avg_rpc_time_ns(),
        }
    }

    /// Average RPC latency over all finished requests
    pub fn avg_rpc_time_ns(&self) -> u64 {
        let total = self.rpc_time_ns.load(Ordering::Relaxed);
        let count = self.rpc_replied.load(Ordering::Relaxed)
            + self.rpc_stream_closed.load(Ordering::Relaxed)
            + self.rpc_timed_out.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }
}

impl MetricsRecorder for Metrics {
    fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connected(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_published(&self, _exchange: &str) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn record_publish_failure(&self, _exchange: &str) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acked(&self, _queue: &str) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    fn record_nacked(&self, _queue: &str, requeue: bool) {
        if requeue {
            self.nacked_requeued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nacked_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_handler_timeout(&self, _queue: &str) {
        self.handler_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rpc(&self, outcome: &RpcOutcome, elapsed: Duration) {
        let counter = match outcome {
            RpcOutcome::Replied(_) => &self.rpc_replied,
            RpcOutcome::StreamClosed => &self.rpc_stream_closed,
            RpcOutcome::TimedOut => &self.rpc_timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.rpc_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn record_correlation_mismatch(&self) {
        self.correlation_mismatches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of `Metrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connect_failures: u64,
    pub connections: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub acked: u64,
    pub nacked_requeued: u64,
    pub nacked_dropped: u64,
    pub handler_timeouts: u64,
    pub rpc_replied: u64,
    pub rpc_stream_closed: u64,
    pub rpc_timed_out: u64,
    pub correlation_mismatches: u64,
    pub avg_rpc_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Envelope;

    #[test]
    fn test_metrics_initialization() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_nacks() {
        let metrics = Metrics::new();
        metrics.record_nacked("q", true);
        metrics.record_nacked("q", true);
        metrics.record_nacked("q", false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.nacked_requeued, 2);
        assert_eq!(snapshot.nacked_dropped, 1);
    }

    #[test]
    fn test_rpc_average() {
        let metrics = Metrics::new();
        metrics.record_rpc(&RpcOutcome::Replied(Envelope::new("pong")), Duration::from_nanos(100));
        metrics.record_rpc(&RpcOutcome::TimedOut, Duration::from_nanos(300));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rpc_replied, 1);
        assert_eq!(snapshot.rpc_timed_out, 1);
        assert_eq!(snapshot.avg_rpc_ns, 200);
    }

    #[test]
    fn test_noop_metrics() {
        let recorder: &dyn MetricsRecorder = &NoOpMetrics;
        recorder.record_published("x");
        recorder.record_rpc(&RpcOutcome::StreamClosed, Duration::ZERO);
    }
}
