// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the transport traits.

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ConnectionStatus,
    ExchangeKind as LapinExchangeKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::errors::{RabbitMQError, Result};
use super::notify::Notifier;
use super::transport::{
    BlockedEvent, BrokerChannel, BrokerConnection, ChannelHandle, CloseEvent, ConnectionHandle,
    DeliveryStream, NotifyStream, Transport,
};
use crate::config::{ConsumerConfig, ExchangeConfig, ExchangeKind, QueueBindConfig, QueueConfig};
use crate::message::{FieldArgs, HeaderValue, MessageEnvelope};

const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(250);
const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// Opens real AMQP 0.9.1 connections.
#[derive(Clone, Default)]
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn open(&self, uri: &str) -> Result<ConnectionHandle> {
        let amqp_uri: AMQPUri = uri
            .parse()
            .map_err(|e: String| RabbitMQError::InvalidConfig(format!("malformed broker URI: {e}")))?;

        let connection = Connection::connect_uri(amqp_uri, self.properties.clone()).await?;
        debug!(scope = "connection", "Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

pub struct LapinConnection {
    connection: Connection,
    closed: Arc<Notifier<CloseEvent>>,
    blocked: Arc<Notifier<BlockedEvent>>,
    blocked_watcher: JoinHandle<()>,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let closed = Arc::new(Notifier::new());
        let blocked = Arc::new(Notifier::new());

        let on_error = Arc::clone(&closed);
        connection.on_error(move |err| {
            on_error.notify(CloseEvent {
                reason: err.to_string(),
            });
        });

        let blocked_watcher = tokio::spawn(watch_blocked(
            connection.status().clone(),
            Arc::clone(&blocked),
        ));

        Self {
            connection,
            closed,
            blocked,
            blocked_watcher,
        }
    }
}

/// lapin records connection.blocked on the connection status without a
/// callback, so transitions are picked up by polling.
async fn watch_blocked(status: ConnectionStatus, blocked: Arc<Notifier<BlockedEvent>>) {
    let mut was_blocked = false;
    let mut ticker = tokio::time::interval(BLOCKED_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let is_blocked = status.blocked();
        if is_blocked != was_blocked {
            was_blocked = is_blocked;
            blocked.notify(if is_blocked {
                BlockedEvent::blocked("connection blocked by server")
            } else {
                BlockedEvent::unblocked()
            });
        }
        if !status.connected() {
            break;
        }
    }
}

impl Drop for LapinConnection {
    fn drop(&mut self) {
        self.blocked_watcher.abort();
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<ChannelHandle> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        // Publisher confirms, so a publish only succeeds once the broker has the message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn close(&self) -> Result<()> {
        self.blocked_watcher.abort();
        self.connection.close(REPLY_SUCCESS, "closed by client").await?;
        self.closed.close();
        self.blocked.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn notify_closed(&self) -> NotifyStream<CloseEvent> {
        self.closed.subscribe()
    }

    fn notify_blocked(&self) -> NotifyStream<BlockedEvent> {
        self.blocked.subscribe()
    }
}

pub struct LapinChannel {
    channel: Channel,
    flow: Notifier<bool>,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            flow: Notifier::new(),
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    /// lapin answers channel.flow itself by holding `basic_publish` until the
    /// server lets go, so this stream stays silent.
    fn notify_flow(&self) -> NotifyStream<bool> {
        self.flow.subscribe()
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<()> {
        let kind = match exchange.kind {
            ExchangeKind::Direct => LapinExchangeKind::Direct,
            ExchangeKind::Fanout => LapinExchangeKind::Fanout,
            ExchangeKind::Topic => LapinExchangeKind::Topic,
            ExchangeKind::Headers => LapinExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    nowait: exchange.no_wait,
                },
                to_field_table(&exchange.args),
            )
            .await
            .map_err(|e| {
                RabbitMQError::DeclareError(format!("exchange '{}': {}", exchange.name, e))
            })
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.no_wait,
                },
                to_field_table(&queue.args),
            )
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::DeclareError(format!("queue '{}': {}", queue.name, e)))
    }

    async fn bind_queue(&self, binding: &QueueBindConfig) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.binding_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                to_field_table(&binding.args),
            )
            .await
            .map_err(|e| {
                RabbitMQError::DeclareError(format!(
                    "binding '{}' -> '{}' ({}): {}",
                    binding.exchange, binding.queue, binding.binding_key, e
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties_for(envelope),
            )
            .await?;

        let confirmation = confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(RabbitMQError::PublishError(format!(
                "broker refused message for '{exchange}' / '{routing_key}'"
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer: &ConsumerConfig) -> Result<DeliveryStream> {
        let deliveries = self
            .channel
            .basic_consume(
                queue,
                &consumer.name,
                BasicConsumeOptions {
                    no_local: consumer.no_local,
                    no_ack: consumer.auto_ack,
                    exclusive: consumer.exclusive,
                    nowait: consumer.no_wait,
                },
                to_field_table(&consumer.args),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(deliveries
            .map(|delivery| {
                delivery
                    .map(envelope_from_delivery)
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        if prefetch_size > 0 {
            warn!(prefetch_size, "lapin does not support prefetch_size; applying count only");
        }
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.flow.close();
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

fn properties_for(envelope: &MessageEnvelope) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_headers(to_field_table(&envelope.headers));

    if let Some(message_id) = &envelope.message_id {
        properties = properties.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(content_type) = &envelope.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(timestamp) = envelope.timestamp {
        if let Ok(seconds) = u64::try_from(timestamp.timestamp()) {
            properties = properties.with_timestamp(seconds);
        }
    }
    properties
}

fn envelope_from_delivery(delivery: Delivery) -> MessageEnvelope {
    let properties = &delivery.properties;
    let headers = properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    MessageEnvelope {
        message_id: properties.message_id().as_ref().map(|id| id.as_str().to_string()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        timestamp: properties
            .timestamp()
            .and_then(|seconds| i64::try_from(seconds).ok())
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0)),
        headers,
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        payload: delivery.data,
    }
}

fn to_field_table(args: &FieldArgs) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        let value = match value {
            HeaderValue::Bool(flag) => AMQPValue::Boolean(*flag),
            HeaderValue::Int(number) => AMQPValue::LongLongInt(*number),
            HeaderValue::Float(number) => AMQPValue::Double(*number),
            HeaderValue::String(text) => AMQPValue::LongString(text.clone().into()),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> FieldArgs {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            from_amqp_value(value).map(|value| (key.as_str().to_string(), value))
        })
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let converted = match value {
        AMQPValue::Boolean(flag) => HeaderValue::Bool(*flag),
        AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
        AMQPValue::Float(n) => HeaderValue::Float(f64::from(*n)),
        AMQPValue::Double(n) => HeaderValue::Float(*n),
        AMQPValue::ShortString(text) => HeaderValue::String(text.as_str().to_string()),
        AMQPValue::LongString(text) => {
            HeaderValue::String(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        AMQPValue::Timestamp(seconds) => HeaderValue::Int(i64::try_from(*seconds).ok()?),
        _ => return None,
    };
    Some(converted)
}
