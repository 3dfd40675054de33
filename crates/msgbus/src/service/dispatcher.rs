//! Consumer dispatch.
//!
//! A subscription declares its queue, binds it, opens a consumer, and runs
//! one dispatch loop. The loop spawns one task per delivery into a
//! `JoinSet` owned by the subscription; each task runs the handler against
//! a deadline and settles the delivery:
//!
//! | handler                     | manual ack mode         |
//! |-----------------------------|-------------------------|
//! | returns before the deadline | ack                     |
//! | still running at deadline   | nack, requeue           |
//! | panics                      | nack, no requeue        |
//!
//! In auto ack mode the broker settled the message on delivery and the
//! outcome is only logged.

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::{AckMode, ExchangeKind, QueueArgument, QueueSpec, RoutingKey};
use crate::error::Result;
use crate::metrics::MetricsRecorder;
use crate::ports::{Delivery, DeliveryStream, MessageHandler};
use crate::service::connection::{ConnectionManager, ScopedChannel};
use crate::service::topology::TopologyManager;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unbound,
    Declared,
    Bound,
    Consuming,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Unbound => "unbound",
            SubscriptionState::Declared => "declared",
            SubscriptionState::Bound => "bound",
            SubscriptionState::Consuming => "consuming",
            SubscriptionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How the dispatcher settled one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler returned `Ok` in time.
    Handled,
    /// The handler returned an error in time. The message is still
    /// acknowledged: redelivering it would fail the same way.
    Failed(String),
    /// The deadline passed first.
    TimedOut,
    /// The handler panicked.
    Panicked,
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Handled => "handled",
            DeliveryOutcome::Failed(_) => "failed",
            DeliveryOutcome::TimedOut => "timed_out",
            DeliveryOutcome::Panicked => "panicked",
        }
    }
}

/// What to declare and consume.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub queue: QueueSpec,
    /// Exchange the routing keys are bound on. Empty for none.
    pub exchange: String,
    /// Declare the exchange with this kind first. `None` expects it to exist.
    pub exchange_kind: Option<ExchangeKind>,
    pub routing_keys: Vec<RoutingKey>,
    pub consumer_tag: String,
    pub ack_mode: AckMode,
}

impl SubscriptionSpec {
    /// Ad hoc queue bound to `exchange` with every key, manual ack.
    pub fn bound(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        kind: ExchangeKind,
        routing_keys: impl IntoIterator<Item = RoutingKey>,
        consumer_tag: impl Into<String>,
    ) -> Self {
        Self {
            queue: QueueSpec::new(queue),
            exchange: exchange.into(),
            exchange_kind: Some(kind),
            routing_keys: routing_keys.into_iter().collect(),
            consumer_tag: consumer_tag.into(),
            ack_mode: AckMode::Manual,
        }
    }

    /// Durable queue named after the service, bound on an existing exchange.
    pub fn service_queue(
        service: impl Into<String>,
        exchange: impl Into<String>,
        routing_keys: impl IntoIterator<Item = RoutingKey>,
        consumer_tag: impl Into<String>,
    ) -> Self {
        Self {
            queue: QueueSpec::durable(service),
            exchange: exchange.into(),
            exchange_kind: None,
            routing_keys: routing_keys.into_iter().collect(),
            consumer_tag: consumer_tag.into(),
            ack_mode: AckMode::Manual,
        }
    }

    /// Plain queue consumed with auto ack.
    pub fn queue(queue: impl Into<String>, consumer_tag: impl Into<String>) -> Self {
        Self {
            queue: QueueSpec::new(queue),
            exchange: String::new(),
            exchange_kind: None,
            routing_keys: Vec::new(),
            consumer_tag: consumer_tag.into(),
            ack_mode: AckMode::Auto,
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: QueueArgument) -> Self {
        self.queue = self.queue.with_argument(key, value);
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }
}

/// Opens subscriptions on the shared connection.
pub struct ConsumerDispatcher {
    connection: Arc<ConnectionManager>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl ConsumerDispatcher {
    pub fn new(connection: Arc<ConnectionManager>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            connection,
            metrics,
        }
    }

    /// Declare, bind and start consuming. Any failure aborts the
    /// subscription; nothing is left consuming.
    pub async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        let channel = self.connection.acquire_channel().await?;
        let (state_tx, state) = watch::channel(SubscriptionState::Unbound);

        let (queue, deliveries) = match open(&channel, &spec, &state_tx).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(
                    queue = %spec.queue.name,
                    exchange = %spec.exchange,
                    state = %*state.borrow(),
                    error = %e,
                    "Subscription failed"
                );
                channel.release().await;
                return Err(e);
            }
        };

        let config = self.connection.config();
        let ctx = Arc::new(DispatchContext {
            queue: queue.clone(),
            ack_mode: spec.ack_mode,
            handler,
            handler_timeout: config.handler_timeout,
            metrics: self.metrics.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatch_loop(
            ctx,
            channel,
            deliveries,
            shutdown_rx,
            config.shutdown_grace,
            state_tx,
        ));

        info!(
            queue = %queue,
            exchange = %spec.exchange,
            consumer_tag = %spec.consumer_tag,
            ack_mode = ?spec.ack_mode,
            "Subscribed"
        );
        Ok(Subscription {
            queue,
            consumer_tag: spec.consumer_tag,
            ack_mode: spec.ack_mode,
            state,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn open(
    channel: &ScopedChannel,
    spec: &SubscriptionSpec,
    state: &watch::Sender<SubscriptionState>,
) -> Result<(String, DeliveryStream)> {
    let topology = TopologyManager::new(&**channel);
    let advance = |next: SubscriptionState| {
        state.send_replace(next);
        debug!(queue = %spec.queue.name, state = %next, "Subscription state changed");
    };

    if let Some(kind) = spec.exchange_kind {
        topology.declare_exchange(&spec.exchange, kind).await?;
    }
    let declared = topology.declare_queue(&spec.queue).await?;
    advance(SubscriptionState::Declared);

    for key in &spec.routing_keys {
        topology
            .bind(&declared.name, key.as_str(), &spec.exchange)
            .await?;
    }
    advance(SubscriptionState::Bound);

    let deliveries = channel
        .consume(&declared.name, &spec.consumer_tag, spec.ack_mode)
        .await?;
    advance(SubscriptionState::Consuming);
    Ok((declared.name, deliveries))
}

/// A running consumer. Stops on `close()` or when dropped; either way
/// in-flight handlers are drained before the channel is released.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    ack_mode: AckMode,
    state: watch::Receiver<SubscriptionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// The consumed queue (broker-generated for anonymous specs).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Stop taking deliveries, give in-flight handlers the shutdown grace
    /// period, abort the rest, then close the channel.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(queue = %self.queue, error = %e, "Dispatch loop ended abnormally");
            }
        }
        Ok(())
    }

    /// Resolve once the dispatch loop has ended, whether through `close()`,
    /// consumer cancellation or connection loss.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // A dropped sender means the loop is gone as well.
        let _ = state
            .wait_for(|s| *s == SubscriptionState::Closed)
            .await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("ack_mode", &self.ack_mode)
            .field("state", &self.state())
            .finish()
    }
}

struct DispatchContext {
    queue: String,
    ack_mode: AckMode,
    handler: Arc<dyn MessageHandler>,
    handler_timeout: Duration,
    metrics: Arc<dyn MetricsRecorder>,
}

async fn dispatch_loop(
    ctx: Arc<DispatchContext>,
    channel: ScopedChannel,
    mut deliveries: DeliveryStream,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
    state: watch::Sender<SubscriptionState>,
) {
    let mut tasks: JoinSet<DeliveryOutcome> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(queue = %ctx.queue, "Dispatch loop stopping");
                break;
            }
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    tasks.spawn(handle_delivery(ctx.clone(), delivery));
                }
                Some(Err(e)) => {
                    error!(queue = %ctx.queue, error = %e, "Delivery stream failed");
                    break;
                }
                None => {
                    info!(queue = %ctx.queue, "Delivery stream closed");
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(&ctx.queue, joined);
            }
        }
    }
    drop(deliveries);

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            log_join(&ctx.queue, joined);
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            queue = %ctx.queue,
            in_flight = tasks.len(),
            grace_ms = grace.as_millis() as u64,
            "Aborting handlers still running after shutdown grace"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    // Unsettled deliveries go back to the queue with the channel.
    channel.release().await;
    state.send_replace(SubscriptionState::Closed);
}

fn log_join(queue: &str, joined: std::result::Result<DeliveryOutcome, tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!(queue = %queue, error = %e, "Delivery task failed");
        }
    }
}

/// Run the handler for one delivery and settle it.
async fn handle_delivery(ctx: Arc<DispatchContext>, delivery: Delivery) -> DeliveryOutcome {
    let deadline = Instant::now() + ctx.handler_timeout;
    let call = AssertUnwindSafe(ctx.handler.handle(delivery.clone(), deadline)).catch_unwind();

    let outcome = match tokio::time::timeout_at(deadline, call).await {
        Ok(Ok(Ok(()))) => DeliveryOutcome::Handled,
        Ok(Ok(Err(e))) => DeliveryOutcome::Failed(e.to_string()),
        Ok(Err(_)) => DeliveryOutcome::Panicked,
        Err(_) => DeliveryOutcome::TimedOut,
    };
    settle(&ctx, &delivery, &outcome).await;
    outcome
}

async fn settle(ctx: &DispatchContext, delivery: &Delivery, outcome: &DeliveryOutcome) {
    let queue = ctx.queue.as_str();
    let tag = delivery.delivery_tag;
    match outcome {
        DeliveryOutcome::Handled => {}
        DeliveryOutcome::Failed(reason) => {
            warn!(queue = %queue, routing_key = %delivery.routing_key, reason = %reason, "Handler returned an error");
        }
        DeliveryOutcome::TimedOut => {
            ctx.metrics.record_handler_timeout(queue);
            warn!(
                queue = %queue,
                routing_key = %delivery.routing_key,
                timeout_ms = ctx.handler_timeout.as_millis() as u64,
                "Handler timed out"
            );
        }
        DeliveryOutcome::Panicked => {
            error!(queue = %queue, routing_key = %delivery.routing_key, "Handler panicked");
        }
    }
    if ctx.ack_mode.is_auto() {
        return;
    }

    let result = match outcome {
        DeliveryOutcome::Handled | DeliveryOutcome::Failed(_) => {
            let r = delivery.ack().await;
            if r.is_ok() {
                ctx.metrics.record_acked(queue);
            }
            r
        }
        DeliveryOutcome::TimedOut => {
            let r = delivery.nack(true).await;
            if r.is_ok() {
                ctx.metrics.record_nacked(queue, true);
            }
            r
        }
        DeliveryOutcome::Panicked => {
            let r = delivery.nack(false).await;
            if r.is_ok() {
                ctx.metrics.record_nacked(queue, false);
            }
            r
        }
    };
    match result {
        Ok(()) => debug!(queue = %queue, delivery_tag = tag, outcome = outcome.label(), "Delivery settled"),
        Err(e) => error!(queue = %queue, delivery_tag = tag, error = %e, "Failed to settle delivery"),
    }
}
