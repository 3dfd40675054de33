//! # msgbus-node
//!
//! Runs one service on the message bus with no application handlers of its
//! own: it answers health checks and logs every event delivered to its
//! queue. Useful as a liveness probe target and for watching traffic on a
//! set of routing keys.

use anyhow::{Context, Result};
use msgbus::{handler_fn, AmqpConnector, EventRouter, MessageBusClient};
use msgbus_runtime::{RuntimeConfig, ServiceRuntime};
use msgbus_telemetry::{init_telemetry, PrometheusRecorder};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env().context("Failed to load configuration")?;
    let _telemetry =
        init_telemetry(config.telemetry.clone()).context("Failed to initialize telemetry")?;

    config
        .bus
        .validate()
        .context("Invalid message bus configuration")?;
    info!(
        address = %config.bus.redacted_address(),
        queue = %config.binding.queue,
        "Configuration loaded"
    );

    let connector = AmqpConnector::new().with_connection_name(config.bus.connection_name.clone());
    let client = Arc::new(MessageBusClient::with_metrics(
        config.bus.clone(),
        Arc::new(connector),
        Arc::new(PrometheusRecorder::new()),
    ));

    let runtime = ServiceRuntime::new(config, client);
    let router = EventRouter::new().fallback(handler_fn(|delivery, _deadline| async move {
        info!(
            routing_key = %delivery.routing_key,
            bytes = delivery.body().len(),
            redelivered = delivery.redelivered,
            "Event received"
        );
        Ok(())
    }));
    runtime.start(router).await?;

    info!("Node is running. Press Ctrl+C to stop.");
    runtime
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
}
