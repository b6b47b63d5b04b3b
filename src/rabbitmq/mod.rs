// src/rabbitmq/mod.rs
// Resilient connection, channel, publish and consume layers over AMQP.

pub mod errors;
pub mod transport;
pub mod amqp_client;
pub mod memory;
pub mod connection;
pub mod channel_manager;
pub mod publisher;
pub mod consumer;
pub mod retry;

mod notify;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinTransport;
pub use channel_manager::ChannelManager;
pub use connection::{ConnectionManager, ConnectionStatus};
pub use consumer::{Consumer, MessageHandler};
pub use errors::{BackpressureCause, RabbitMQError, Result};
pub use memory::{MemoryBroker, PublishedMessage, QosSettings};
pub use publisher::Publisher;
pub use retry::{Disposition, RetryPolicy};
pub use transport::{
    BlockedEvent, BrokerChannel, BrokerConnection, ChannelHandle, CloseEvent, ConnectionHandle,
    DeliveryStream, NotifyStream, Transport,
};
