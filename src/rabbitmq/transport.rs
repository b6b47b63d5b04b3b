// src/rabbitmq/transport.rs
// The broker capability the managers are written against.

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::errors::Result;
use crate::config::{ConsumerConfig, ExchangeConfig, QueueBindConfig, QueueConfig};
use crate::message::MessageEnvelope;

/// A connection went away without the caller asking for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub reason: String,
}

/// connection.blocked / connection.unblocked from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedEvent {
    pub active: bool,
    pub reason: String,
}

impl BlockedEvent {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            active: true,
            reason: reason.into(),
        }
    }

    pub fn unblocked() -> Self {
        Self {
            active: false,
            reason: String::new(),
        }
    }
}

pub type NotifyStream<T> = UnboundedReceiver<T>;
pub type DeliveryStream = BoxStream<'static, Result<MessageEnvelope>>;
pub type ConnectionHandle = Arc<dyn BrokerConnection>;
pub type ChannelHandle = Arc<dyn BrokerChannel>;

/// Opens connections to a broker URI.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, uri: &str) -> Result<ConnectionHandle>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<ChannelHandle>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Yields once when the connection is lost.
    fn notify_closed(&self) -> NotifyStream<CloseEvent>;

    fn notify_blocked(&self) -> NotifyStream<BlockedEvent>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// `true` asks the publisher to pause, `false` to resume.
    fn notify_flow(&self) -> NotifyStream<bool>;

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<()>;

    async fn bind_queue(&self, binding: &QueueBindConfig) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, consumer: &ConsumerConfig) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
