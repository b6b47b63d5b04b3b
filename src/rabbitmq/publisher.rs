// src/rabbitmq/publisher.rs
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel_manager::ChannelManager;
use super::connection::ConnectionManager;
use super::errors::{BackpressureCause, RabbitMQError, Result};
use super::transport::ChannelHandle;
use crate::config::{ExchangeConfig, PublisherOptions};
use crate::message::MessageEnvelope;

/// Publishes on its own channel, refusing while the broker applies backpressure.
///
/// Two gates hold publishes back: channel flow control and TCP blocking on the
/// connection. Each gate is written by exactly one listener task; `publish`
/// only reads them and fails with [`RabbitMQError::Backpressure`] instead of
/// buffering.
pub struct Publisher {
    name: String,
    exchanges: Vec<ExchangeConfig>,
    channels: ChannelManager,
    /// Serializes publishes and remembers the channel the exchanges were declared on.
    declared_on: Mutex<Option<ChannelHandle>>,
    flow: watch::Receiver<bool>,
    blocked: watch::Receiver<bool>,
    listeners: Vec<JoinHandle<()>>,
}

impl Publisher {
    /// Opens a channel on `connection` and declares the configured exchanges.
    pub async fn new(connection: ConnectionManager, options: PublisherOptions) -> Result<Self> {
        let channels = ChannelManager::new(connection.clone());
        let name = if options.name.is_empty() {
            "publisher".to_string()
        } else {
            options.name
        };

        let (flow_gate, flow) = watch::channel(false);
        let (blocked_gate, blocked) = watch::channel(false);
        let listeners = vec![
            spawn_gate(
                name.clone(),
                BackpressureCause::Flow,
                channels.notify_flow(),
                flow_gate,
            ),
            spawn_gate(
                name.clone(),
                BackpressureCause::Blocked,
                connection.notify_blocked().map(|event| event.active),
                blocked_gate,
            ),
        ];

        let publisher = Self {
            name,
            exchanges: options.exchanges,
            channels,
            declared_on: Mutex::new(None),
            flow,
            blocked,
            listeners,
        };

        let channel = publisher.channels.get_channel().await?;
        publisher.declare_exchanges(&channel).await?;
        *publisher.declared_on.lock().await = Some(channel);
        Ok(publisher)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends one message. Missing message and correlation ids are generated.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mut envelope: MessageEnvelope,
    ) -> Result<()> {
        self.check_gates()?;
        let mut declared_on = self.declared_on.lock().await;
        // A gate may have closed while this call waited its turn.
        self.check_gates()?;

        envelope.stamp_for_publish();
        let outgoing = envelope.to_outgoing();

        let mut retried = false;
        loop {
            let channel = self.channels.get_channel().await?;
            let stale = !declared_on
                .as_ref()
                .is_some_and(|declared| Arc::ptr_eq(declared, &channel));
            if stale {
                self.declare_exchanges(&channel).await?;
                *declared_on = Some(Arc::clone(&channel));
            }

            match channel.publish(exchange, routing_key, &outgoing).await {
                Ok(()) => {
                    debug!(
                        scope = "publisher",
                        publisher = %self.name,
                        exchange,
                        routing_key,
                        message_id = outgoing.message_id.as_deref().unwrap_or_default(),
                        "published message"
                    );
                    return Ok(());
                }
                Err(err) if err.is_retryable() && !retried => {
                    warn!(scope = "publisher", publisher = %self.name, error = %err, "publish failed, retrying on a fresh channel");
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<()> {
        let envelope = MessageEnvelope::json(value)?;
        self.publish(exchange, routing_key, envelope).await
    }

    /// Current value and changes of the flow gate; `true` means paused.
    pub fn watch_flow(&self) -> watch::Receiver<bool> {
        self.flow.clone()
    }

    /// Current value and changes of the TCP blocking gate; `true` means blocked.
    pub fn watch_blocked(&self) -> watch::Receiver<bool> {
        self.blocked.clone()
    }

    pub async fn close(&self) -> Result<()> {
        for listener in &self.listeners {
            listener.abort();
        }
        self.channels.close().await
    }

    fn check_gates(&self) -> Result<()> {
        if *self.flow.borrow() {
            return Err(RabbitMQError::Backpressure(BackpressureCause::Flow));
        }
        if *self.blocked.borrow() {
            return Err(RabbitMQError::Backpressure(BackpressureCause::Blocked));
        }
        Ok(())
    }

    async fn declare_exchanges(&self, channel: &ChannelHandle) -> Result<()> {
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await?;
            debug!(scope = "publisher", publisher = %self.name, exchange = %exchange.name, "exchange declared");
        }
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

/// Drives one gate from a notification stream, logging each transition.
fn spawn_gate<S>(
    publisher: String,
    cause: BackpressureCause,
    mut events: S,
    gate: watch::Sender<bool>,
) -> JoinHandle<()>
where
    S: Stream<Item = bool> + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(active) = events.next().await {
            let changed = gate.send_if_modified(|current| {
                let changed = *current != active;
                *current = active;
                changed
            });
            if !changed {
                continue;
            }
            if active {
                warn!(scope = "publisher", %publisher, "pausing publishing due to {cause}");
            } else {
                warn!(scope = "publisher", %publisher, "resuming publishing due to {cause}");
            }
        }
    })
}
