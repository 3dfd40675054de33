//! In-process broker.
//!
//! Implements enough of the AMQP 0-9-1 model for the bus to run without a
//! server: durable/topic/direct/fanout exchanges, broker-named queues, the
//! direct reply-to pseudo queue, manual and automatic acknowledgement, and
//! requeue of unsettled messages when a channel or connection goes away.
//! Connection failures can be injected to exercise the retry loop.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::domain::{
    topic_matches, AckMode, DeclaredQueue, Envelope, ExchangeKind, ExchangeSpec, QueueSpec,
    DEFAULT_EXCHANGE, DIRECT_REPLY_TO,
};
use crate::error::BusError;
use crate::ports::{
    Acker, AutoAcked, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream,
};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BusError>>;

/// A broker living inside the process. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    failures_remaining: AtomicU32,
    connect_attempts: AtomicU64,
    next_id: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    /// Reply address -> consumer on the owning channel.
    reply_consumers: HashMap<String, ReplyConsumer>,
    /// Open connections and their closed flags.
    connections: HashMap<u64, Arc<AtomicBool>>,
    next_delivery_tag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct Message {
    envelope: Envelope,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

struct Unacked {
    message: Message,
    owner: Owner,
}

struct Consumer {
    tag: String,
    owner: Owner,
    ack_mode: AckMode,
    tx: DeliverySender,
}

struct ReplyConsumer {
    owner: Owner,
    tx: DeliverySender,
}

/// The connection and channel a consumer or unsettled message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner {
    connection: u64,
    channel: u64,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    fn same_parameters(&self, spec: &QueueSpec) -> bool {
        self.spec.durable == spec.durable
            && self.spec.exclusive == spec.exclusive
            && self.spec.auto_delete == spec.auto_delete
            && self.spec.arguments == spec.arguments
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
                failures_remaining: AtomicU32::new(0),
                connect_attempts: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make every connection attempt fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts, failed ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drop every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state.lock();
        let dropped: Vec<u64> = state.connections.keys().copied().collect();
        for (_, flag) in state.connections.drain() {
            flag.store(true, Ordering::SeqCst);
        }
        self.inner
            .teardown(&mut state, |owner| dropped.contains(&owner.connection));
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.state.lock().exchanges.contains_key(name)
    }

    pub fn exchange_count(&self) -> usize {
        self.inner.state.lock().exchanges.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.inner.state.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.inner.state.lock().bindings.len()
    }

    /// Whether `queue` is bound to `exchange` with exactly `routing_key`.
    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.inner.state.lock().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }

    /// Declared durability of `queue`, if it exists.
    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.spec.clone())
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn reply_consumer_count(&self) -> usize {
        self.inner.state.lock().reply_consumers.len()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, _address: &str) -> Result<Arc<dyn BrokerConnection>, BusError> {
        let inner = &self.inner;
        inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !inner.reachable.load(Ordering::SeqCst) {
            return Err(BusError::connectivity("connection refused"));
        }
        let injected = inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::connectivity("connection refused"));
        }

        let id = inner.next_id();
        let closed = Arc::new(AtomicBool::new(false));
        inner.state.lock().connections.insert(id, closed.clone());
        debug!(connection = id, "in-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: inner.clone(),
            id,
            closed,
        }))
    }
}

impl BrokerInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Remove consumers selected by `owned` and requeue the messages they
    /// left unsettled.
    fn teardown(self: &Arc<Self>, state: &mut BrokerState, owned: impl Fn(Owner) -> bool) {
        state.reply_consumers.retain(|_, c| !owned(c.owner));

        let mut touched = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !owned(c.owner));

            let mut orphaned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| owned(u.owner))
                .map(|(tag, _)| *tag)
                .collect();
            orphaned.sort_unstable();
            for tag in &orphaned {
                if let Some(mut unacked) = queue.unacked.remove(tag) {
                    unacked.message.redelivered = true;
                    queue.ready.push_back(unacked.message);
                }
            }
            if before != queue.consumers.len() || !orphaned.is_empty() {
                touched.push(name.clone());
            }
        }
        for name in touched {
            self.dispatch(state, &name);
        }
    }

    /// Hand ready messages of `queue_name` to its consumers, round-robin.
    fn dispatch(self: &Arc<Self>, state: &mut BrokerState, queue_name: &str) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let index = queue.cursor % queue.consumers.len();
            let tag = state.next_delivery_tag + 1;
            let ack_mode = queue.consumers[index].ack_mode;
            let owner = queue.consumers[index].owner;

            let acker: Arc<dyn Acker> = match ack_mode {
                AckMode::Auto => Arc::new(AutoAcked),
                AckMode::Manual => Arc::new(MemoryAcker {
                    broker: Arc::downgrade(self),
                    queue: queue_name.to_string(),
                    tag,
                }),
            };
            let delivery = Delivery {
                envelope: message.envelope.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                delivery_tag: tag,
                redelivered: message.redelivered,
                acker,
            };

            if queue.consumers[index].tx.send(Ok(delivery)).is_err() {
                // Receiver dropped without cancelling.
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }
            trace!(queue = %queue_name, delivery_tag = tag, "message delivered");
            state.next_delivery_tag = tag;
            queue.cursor = index + 1;
            if ack_mode == AckMode::Manual {
                queue.unacked.insert(tag, Unacked { message, owner });
            }
        }
    }

    /// Route a published message. Unroutable messages are dropped, as the
    /// broker does for non-mandatory publishes.
    fn route(
        self: &Arc<Self>,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<usize, BusError> {
        let message = Message {
            envelope,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };

        if exchange == DEFAULT_EXCHANGE {
            if routing_key.starts_with(DIRECT_REPLY_TO) {
                return Ok(self.deliver_reply(state, message));
            }
            if !state.queues.contains_key(routing_key) {
                return Ok(0);
            }
            if let Some(queue) = state.queues.get_mut(routing_key) {
                queue.ready.push_back(message);
            }
            self.dispatch(state, routing_key);
            return Ok(1);
        }

        let Some(spec) = state.exchanges.get(exchange) else {
            return Err(BusError::publish(
                exchange,
                routing_key,
                format!("no exchange '{exchange}' in vhost"),
            ));
        };
        let kind = spec.kind;

        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Headers => false,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(state, name);
        }
        Ok(targets.len())
    }

    fn deliver_reply(&self, state: &mut BrokerState, message: Message) -> usize {
        let Some(consumer) = state.reply_consumers.get(&message.routing_key) else {
            trace!(address = %message.routing_key, "reply address has no consumer, dropped");
            return 0;
        };
        let tag = state.next_delivery_tag + 1;
        let delivery = Delivery {
            envelope: message.envelope,
            exchange: message.exchange,
            routing_key: message.routing_key,
            delivery_tag: tag,
            redelivered: false,
            acker: Arc::new(AutoAcked),
        };
        if consumer.tx.send(Ok(delivery)).is_err() {
            return 0;
        }
        state.next_delivery_tag = tag;
        1
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    id: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        if self.is_closed() {
            return Err(BusError::connectivity("connection is closed"));
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            owner: Owner {
                connection: self.id,
                channel: self.broker.next_id(),
            },
            connection_closed: self.closed.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.state.lock();
        state.connections.remove(&self.id);
        let id = self.id;
        self.broker.teardown(&mut state, |owner| owner.connection == id);
        debug!(connection = id, "in-memory connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    broker: Arc<BrokerInner>,
    owner: Owner,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(BusError::channel(format!(
                "channel {} is closed",
                self.owner.channel
            )));
        }
        Ok(())
    }

    fn reply_address(&self) -> String {
        format!(
            "{DIRECT_REPLY_TO}.{}.{}",
            self.owner.connection, self.owner.channel
        )
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BusError> {
        self.ensure_open()?;
        if spec.name.is_empty() {
            return Err(BusError::topology(
                "declare exchange",
                "",
                "access to the default exchange is refused",
            ));
        }
        let mut state = self.broker.state.lock();
        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing != spec {
                return Err(BusError::topology(
                    "declare exchange",
                    &spec.name,
                    "inequivalent arguments for existing exchange",
                ));
            }
            return Ok(());
        }
        state.exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, BusError> {
        self.ensure_open()?;
        let mut resolved = spec.clone();
        if resolved.is_anonymous() {
            resolved.name = format!("amq.gen-{:016x}", self.broker.next_id());
        }

        let mut state = self.broker.state.lock();
        if let Some(existing) = state.queues.get(&resolved.name) {
            if !existing.same_parameters(&resolved) {
                return Err(BusError::topology(
                    "declare queue",
                    &resolved.name,
                    "inequivalent arguments for existing queue",
                ));
            }
        }
        let queue = state
            .queues
            .entry(resolved.name.clone())
            .or_insert_with(|| QueueState::new(resolved.clone()));
        Ok(DeclaredQueue {
            name: resolved.name.clone(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::topology(
                "bind queue",
                queue,
                format!("no exchange '{exchange}' in vhost"),
            ));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::topology(
                "bind queue",
                queue,
                "no such queue in vhost",
            ));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mut envelope: Envelope,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if envelope.reply_to.as_deref() == Some(DIRECT_REPLY_TO) {
            let address = self.reply_address();
            if !state.reply_consumers.contains_key(&address) {
                return Err(BusError::publish(
                    exchange,
                    routing_key,
                    "fast reply consumer does not exist",
                ));
            }
            envelope.reply_to = Some(address);
        }
        let routed = self
            .broker
            .route(&mut state, exchange, routing_key, envelope)?;
        trace!(exchange = %exchange, routing_key = %routing_key, routed, "message published");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, BusError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.state.lock();

        if queue == DIRECT_REPLY_TO {
            if !ack_mode.is_auto() {
                return Err(BusError::consume(
                    queue,
                    "reply consumer cannot acknowledge messages",
                ));
            }
            let address = self.reply_address();
            if state.reply_consumers.contains_key(&address) {
                return Err(BusError::consume(queue, "reply consumer already set"));
            }
            state.reply_consumers.insert(
                address,
                ReplyConsumer {
                    owner: self.owner,
                    tx,
                },
            );
            return Ok(UnboundedReceiverStream::new(rx).boxed());
        }

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", self.broker.next_id())
        } else {
            consumer_tag.to_string()
        };
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(BusError::consume(queue, "no such queue in vhost"));
        };
        if target
            .consumers
            .iter()
            .any(|c| c.owner == self.owner && c.tag == tag)
        {
            return Err(BusError::consume(
                queue,
                format!("attempt to reuse consumer tag '{tag}'"),
            ));
        }
        target.consumers.push(Consumer {
            tag,
            owner: self.owner,
            ack_mode,
            tx,
        });
        self.broker.dispatch(&mut state, queue);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.state.lock();
        let owner = self.owner;
        self.broker.teardown(&mut state, |o| o == owner);
        Ok(())
    }
}

/// Settles a manual-ack delivery against the broker state.
struct MemoryAcker {
    broker: Weak<BrokerInner>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn take(&self, state: &mut BrokerState) -> Result<Message, BusError> {
        state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .map(|u| u.message)
            .ok_or_else(|| {
                BusError::ack(format!(
                    "unknown delivery tag {} on queue '{}'",
                    self.tag, self.queue
                ))
            })
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| BusError::ack("broker is gone"))?;
        let mut state = broker.state.lock();
        self.take(&mut state).map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| BusError::ack("broker is gone"))?;
        let mut state = broker.state.lock();
        let mut message = self.take(&mut state)?;
        if requeue {
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.ready.push_back(message);
            }
            broker.dispatch(&mut state, &self.queue);
        }
        Ok(())
    }
}
