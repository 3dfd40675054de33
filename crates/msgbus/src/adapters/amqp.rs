//! AMQP 0-9-1 adapter over `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::debug;

use crate::config::redact_address;
use crate::domain::{
    AckMode, DeclaredQueue, Envelope, ExchangeKind, ExchangeSpec, QueueArgument, QueueSpec,
};
use crate::error::BusError;
use crate::ports::{
    Acker, AutoAcked, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream,
};

const REPLY_SUCCESS: u16 = 200;

/// Connects to a RabbitMQ-compatible broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    connection_name: Option<String>,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name reported to the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, BusError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }
        let connection = Connection::connect(address, properties)
            .await
            .map_err(|e| {
                BusError::connectivity(format!("{}: {e}", redact_address(address)))
            })?;
        debug!(address = %redact_address(address), "AMQP connection established");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BusError::channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::connectivity(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }
}

struct AmqpChannel {
    inner: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn field_table(spec: &QueueSpec) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in &spec.arguments {
        let value = match value {
            QueueArgument::Bool(b) => AMQPValue::Boolean(*b),
            QueueArgument::Int(i) => AMQPValue::LongLongInt(*i),
            QueueArgument::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn properties(envelope: &Envelope) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(content_type) = &envelope.content_type {
        props = props.with_content_type(content_type.clone().into());
    }
    if let Some(correlation_id) = &envelope.correlation_id {
        props = props.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &envelope.reply_to {
        props = props.with_reply_to(reply_to.clone().into());
    }
    props
}

fn to_envelope(delivery: &lapin::message::Delivery) -> Envelope {
    let props = &delivery.properties;
    Envelope {
        body: delivery.data.clone(),
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BusError> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            internal: spec.internal,
            ..Default::default()
        };
        self.inner
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology("declare exchange", &spec.name, e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, BusError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..Default::default()
        };
        let queue = self
            .inner
            .queue_declare(&spec.name, options, field_table(spec))
            .await
            .map_err(|e| BusError::topology("declare queue", &spec.name, e))?;
        Ok(DeclaredQueue {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), BusError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology("bind queue", queue, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BusError> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties(&envelope),
            )
            .await
            .map_err(|e| BusError::publish(exchange, routing_key, e))?;
        confirm
            .await
            .map_err(|e| BusError::publish(exchange, routing_key, e))?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, BusError> {
        let options = BasicConsumeOptions {
            no_ack: ack_mode.is_auto(),
            ..Default::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| BusError::consume(queue, e))?;

        let queue = queue.to_string();
        let stream = consumer.map(move |item| {
            let delivery = item.map_err(|e| BusError::consume(&queue, e))?;
            let acker: Arc<dyn Acker> = if ack_mode.is_auto() {
                Arc::new(AutoAcked)
            } else {
                Arc::new(AmqpAcker {
                    inner: delivery.acker.clone(),
                })
            };
            Ok(Delivery {
                envelope: to_envelope(&delivery),
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                acker,
            })
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::channel(e.to_string()))
    }
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.inner
            .nack(options)
            .await
            .map_err(|e| BusError::ack(e.to_string()))
    }
}
