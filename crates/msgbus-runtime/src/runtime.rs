//! # Service Runtime
//!
//! Hosts one service on the bus: connect, subscribe, serve, shut down.
//!
//! ## Startup Sequence
//!
//! 1. Connect to the broker (retries until reachable)
//! 2. Subscribe the service queue with its request/response keys plus the
//!    health key, dispatching through an `EventRouter`
//! 3. Serve until Ctrl-C, a shutdown request, or the subscription ending
//! 4. Close the client: drain in-flight handlers, close the connection

use anyhow::{Context, Result};
use msgbus::{EventRouter, MessageBusClient, RoutingKey, Subscription};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::health::{health_routing_key, HealthResponder};

pub struct ServiceRuntime {
    config: RuntimeConfig,
    client: Arc<MessageBusClient>,
    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,
    subscription: Mutex<Option<Arc<Subscription>>>,
}

impl ServiceRuntime {
    pub fn new(config: RuntimeConfig, client: Arc<MessageBusClient>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            client,
            shutdown_tx,
            subscription: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<MessageBusClient> {
        &self.client
    }

    pub fn health_key(&self) -> Result<RoutingKey> {
        health_routing_key(&self.config.org, &self.config.system, &self.config.service)
            .context("Invalid service identity")
    }

    /// Connect and subscribe the service queue. Deliveries on the health
    /// key are answered here; everything else goes to `router`.
    pub async fn start(&self, router: EventRouter) -> Result<Arc<Subscription>> {
        info!(
            service = %self.config.service,
            system = %self.config.system,
            org = %self.config.org,
            "Starting service runtime"
        );

        let health_key = self.health_key()?;
        self.client
            .connect()
            .await
            .context("Failed to connect to message bus")?;

        let binding = &self.config.binding;
        let mut keys: Vec<RoutingKey> = binding.all_routing_keys().cloned().collect();
        keys.push(health_key.clone());

        let router = EventRouter::new()
            .route(health_key.as_str(), HealthResponder::new(self.client.clone()))
            .fallback(router);

        let subscription = self
            .client
            .subscribe(
                &binding.queue,
                &binding.exchange,
                binding.exchange_kind,
                &keys,
                &self.config.consumer_tag,
                router,
            )
            .await
            .with_context(|| format!("Failed to subscribe queue '{}'", binding.queue))?;

        *self.subscription.lock() = Some(subscription.clone());
        info!(
            queue = %subscription.queue(),
            exchange = %binding.exchange,
            routing_keys = keys.len(),
            "Service is running"
        );
        Ok(subscription)
    }

    /// Ask a running `run_until` to stop.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Serve until `signal` resolves, `request_shutdown` is called, or the
    /// subscription ends on its own; then shut down.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let subscription = self
            .subscription
            .lock()
            .clone()
            .context("Service runtime was not started")?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::select! {
            _ = signal => info!("Shutdown signal received"),
            _ = async {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            } => info!("Shutdown requested"),
            _ = subscription.closed() => warn!(
                queue = %subscription.queue(),
                "Subscription ended unexpectedly"
            ),
        }
        self.shutdown().await
    }

    /// Close the subscription and the connection.
    ///
    /// ## Shutdown Sequence
    ///
    /// 1. Signal shutdown
    /// 2. Stop consuming; in-flight handlers get the shutdown grace period
    /// 3. Close the broker connection
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");
        self.shutdown_tx.send_replace(true);
        self.subscription.lock().take();
        self.client
            .close()
            .await
            .context("Failed to close message bus client")?;
        info!("Shutdown complete");
        Ok(())
    }
}
