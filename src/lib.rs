// src/lib.rs
//! A resilient client layer for AMQP 0.9.1 brokers.
//!
//! [`ConnectionManager`] keeps one connection alive across broker restarts,
//! [`ChannelManager`] keeps a channel on top of it, [`Publisher`] publishes
//! while honouring flow control and TCP blocking, and [`Consumer`] hands
//! deliveries to a [`MessageHandler`] with bounded retries and dead-lettering.

pub mod config;
pub mod env;
pub mod id;
pub mod logging;
pub mod message;
pub mod rabbitmq;

pub use config::{
    ConnectionConfig, ConsumerConfig, ConsumerOptions, DeadLetterConfig, ExchangeConfig,
    ExchangeKind, MessageRetryConfig, PublisherOptions, QueueBindConfig, QueueConfig, RmqSettings,
};
pub use env::EnvSettings;
pub use id::generate_id;
pub use logging::init_tracing;
pub use message::{HeaderValue, MessageEnvelope, ProcessingOutcome};
pub use rabbitmq::{
    BackpressureCause, ChannelManager, ConnectionManager, ConnectionStatus, Consumer,
    MessageHandler, Publisher, RabbitMQError, Result, RetryPolicy,
};
