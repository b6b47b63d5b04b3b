// src/rabbitmq/consumer.rs
use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::channel_manager::ChannelManager;
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::retry::{Disposition, RetryPolicy};
use super::transport::{ChannelHandle, DeliveryStream};
use crate::config::{ConsumerOptions, QueueBindConfig};
use crate::message::{MessageEnvelope, ProcessingOutcome, DEAD_LETTER_REASON_HEADER};

/// Application code invoked once per delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: MessageEnvelope) -> ProcessingOutcome;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessingOutcome> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) -> ProcessingOutcome {
        (self)(envelope).await
    }
}

/// Consumes one queue on its own channel, settling each delivery according
/// to the handler's outcome and the retry policy.
pub struct Consumer {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    options: ConsumerOptions,
    connection: ConnectionManager,
    channels: ChannelManager,
    policy: RetryPolicy,
}

impl Consumer {
    pub fn new(connection: ConnectionManager, options: ConsumerOptions) -> Result<Self> {
        if options.consumer.name.trim().is_empty() {
            return Err(RabbitMQError::InvalidConfig(
                "consumer name must not be empty".to_string(),
            ));
        }
        if options.queue.name.trim().is_empty() {
            return Err(RabbitMQError::InvalidConfig(format!(
                "consumer '{}' has no queue name",
                options.consumer.name
            )));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                policy: RetryPolicy::new(options.retry),
                channels: ChannelManager::new(connection.clone()),
                connection,
                options,
            }),
            stop: watch::Sender::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.options.consumer.name
    }

    /// Declares the topology, subscribes and starts handing deliveries to `handler`.
    ///
    /// Declaration and subscription errors are returned here; later failures
    /// are handled inside the delivery loop.
    pub async fn start<H: MessageHandler>(&self, handler: H) -> Result<()> {
        let options = &self.inner.options;
        if !options.consumer.enabled {
            return Err(RabbitMQError::InvalidConfig(format!(
                "consumer '{}' is disabled",
                options.consumer.name
            )));
        }

        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(RabbitMQError::ConsumeError(format!(
                "consumer '{}' is already started",
                options.consumer.name
            )));
        }

        let (channel, deliveries) = self.inner.subscribe().await?;
        self.stop.send_replace(false);
        *worker = Some(tokio::spawn(deliver(
            Arc::clone(&self.inner),
            Arc::new(handler),
            channel,
            deliveries,
            self.stop.subscribe(),
        )));
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stops taking deliveries, lets the current handler finish and closes the channel.
    pub async fn stop(&self) -> Result<()> {
        self.stop.send_replace(true);
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(scope = "consumer", consumer = %self.name(), error = %err, "delivery loop ended abnormally");
            }
        }
        self.inner.channels.close().await
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl Inner {
    fn name(&self) -> &str {
        &self.options.consumer.name
    }

    async fn subscribe(&self) -> Result<(ChannelHandle, DeliveryStream)> {
        let options = &self.options;
        let channel = self.channels.get_channel().await?;

        channel.declare_queue(&options.queue).await?;
        if options.retry.enabled && options.retry.handle_dead_message {
            let dead_letter = options.dead_letter();
            if let Some(queue) = &dead_letter.queue {
                channel.declare_queue(queue).await?;
                if !dead_letter.exchange.is_empty() {
                    channel
                        .bind_queue(&QueueBindConfig::new(
                            &dead_letter.exchange,
                            &queue.name,
                            &dead_letter.routing_key,
                        ))
                        .await?;
                }
            }
        }
        for binding in &options.bindings {
            channel.bind_queue(binding).await?;
        }

        let consumer = &options.consumer;
        if consumer.enabled_prefetch {
            channel
                .set_qos(consumer.prefetch_count, consumer.prefetch_size, consumer.global)
                .await?;
        }

        let deliveries = channel.consume(&options.queue.name, consumer).await?;
        info!(
            scope = "consumer",
            consumer = %consumer.name,
            queue = %options.queue.name,
            "consuming"
        );
        Ok((channel, deliveries))
    }

    /// Subscribes again after the delivery stream ended. `None` means give up
    /// or stopped, even while the connection is still being re-established.
    async fn resubscribe(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<(ChannelHandle, DeliveryStream)> {
        let interval = self.connection.config().reconnect_interval;
        loop {
            let subscribed = tokio::select! {
                _ = stopped(stop) => return None,
                subscribed = self.subscribe() => subscribed,
            };
            match subscribed {
                Ok(subscription) => {
                    info!(scope = "consumer", consumer = %self.name(), "resumed consuming");
                    return Some(subscription);
                }
                Err(err) if err.is_fatal() || matches!(err, RabbitMQError::DeclareError(_)) => {
                    error!(scope = "consumer", consumer = %self.name(), error = %err, "cannot resume consuming");
                    return None;
                }
                Err(err) => {
                    warn!(
                        scope = "consumer",
                        consumer = %self.name(),
                        error = %err,
                        "resubscribe failed, retrying in {interval:?}"
                    );
                    tokio::select! {
                        _ = stopped(stop) => return None,
                        _ = sleep(interval) => {}
                    }
                }
            }
        }
    }

    async fn process(
        &self,
        handler: &dyn MessageHandler,
        channel: &ChannelHandle,
        envelope: MessageEnvelope,
    ) {
        let tag = envelope.delivery_tag;
        let retry_count = envelope.retry_count();
        let outcome = handler.handle(envelope.clone()).await;
        let disposition = self.policy.decide(outcome, retry_count);
        debug!(
            scope = "consumer",
            consumer = %self.name(),
            delivery_tag = tag,
            ?outcome,
            ?disposition,
            "handled delivery"
        );

        if outcome == ProcessingOutcome::Retry
            && matches!(disposition, Disposition::DeadLetter { .. } | Disposition::Discard { .. })
        {
            let exhausted = RabbitMQError::ProcessingExhausted {
                delivery_tag: tag,
                retries: retry_count,
            };
            warn!(scope = "consumer", consumer = %self.name(), "{exhausted}");
        }

        let settled = match disposition {
            Disposition::Ack => self.ack(channel, tag).await,
            Disposition::Requeue { retry_count } => {
                let mut retry = envelope.to_outgoing();
                retry.set_retry_count(retry_count);
                let (exchange, routing_key) = self.options.retry_destination();
                self.forward(channel, tag, &exchange, &routing_key, &retry)
                    .await
            }
            Disposition::DeadLetter { reason } => {
                let dead_letter = self.options.dead_letter();
                let dead = envelope
                    .to_outgoing()
                    .with_header(DEAD_LETTER_REASON_HEADER, reason.as_str());
                warn!(
                    scope = "consumer",
                    consumer = %self.name(),
                    delivery_tag = tag,
                    %reason,
                    routing_key = %dead_letter.routing_key,
                    "dead-lettering message"
                );
                self.forward(
                    channel,
                    tag,
                    &dead_letter.exchange,
                    &dead_letter.routing_key,
                    &dead,
                )
                .await
            }
            Disposition::Discard { reason } => {
                warn!(scope = "consumer", consumer = %self.name(), delivery_tag = tag, %reason, "discarding message");
                self.ack(channel, tag).await
            }
            Disposition::Redeliver => self.nack(channel, tag, true).await,
            Disposition::Drop => self.nack(channel, tag, false).await,
        };

        if let Err(err) = settled {
            warn!(
                scope = "consumer",
                consumer = %self.name(),
                delivery_tag = tag,
                error = %err,
                "could not settle delivery; the broker will redeliver it"
            );
        }
    }

    /// Publishes a copy elsewhere, then acks the original. If the copy cannot
    /// be published the original goes back to the queue.
    async fn forward(
        &self,
        channel: &ChannelHandle,
        tag: u64,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        match channel.publish(exchange, routing_key, envelope).await {
            Ok(()) => self.ack(channel, tag).await,
            Err(err) => {
                warn!(
                    scope = "consumer",
                    consumer = %self.name(),
                    delivery_tag = tag,
                    %exchange,
                    %routing_key,
                    error = %err,
                    "republish failed, returning message to the queue"
                );
                self.nack(channel, tag, true).await
            }
        }
    }

    async fn ack(&self, channel: &ChannelHandle, tag: u64) -> Result<()> {
        if self.options.consumer.auto_ack {
            return Ok(());
        }
        channel.ack(tag).await
    }

    async fn nack(&self, channel: &ChannelHandle, tag: u64, requeue: bool) -> Result<()> {
        if self.options.consumer.auto_ack {
            debug!(scope = "consumer", consumer = %self.name(), delivery_tag = tag, requeue, "auto-ack delivery cannot be returned");
            return Ok(());
        }
        channel.nack(tag, requeue).await
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // An error means the consumer itself is gone, which also means stop.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn flow_resumed(flow: &mut watch::Receiver<bool>) -> bool {
    flow.wait_for(|paused| !*paused).await.is_ok()
}

/// Handles deliveries one at a time, in arrival order, until stopped.
async fn deliver(
    inner: Arc<Inner>,
    handler: Arc<dyn MessageHandler>,
    mut channel: ChannelHandle,
    mut deliveries: DeliveryStream,
    mut stop: watch::Receiver<bool>,
) {
    let mut flow = inner.channels.flow_state();
    loop {
        if inner.options.consumer.pause_on_flow && *flow.borrow() {
            info!(scope = "consumer", consumer = %inner.name(), "pausing consumption due to flow request from server");
            tokio::select! {
                _ = stopped(&mut stop) => break,
                resumed = flow_resumed(&mut flow) => {
                    if !resumed {
                        break;
                    }
                    info!(scope = "consumer", consumer = %inner.name(), "resuming consumption");
                    continue;
                }
            }
        }

        let next = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = flow.changed(), if inner.options.consumer.pause_on_flow => continue,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(envelope)) => inner.process(handler.as_ref(), &channel, envelope).await,
            Some(Err(err)) if err.is_fatal() => {
                error!(scope = "consumer", consumer = %inner.name(), error = %err, "delivery stream failed");
                break;
            }
            Some(Err(err)) => {
                warn!(scope = "consumer", consumer = %inner.name(), error = %err, "delivery error");
            }
            None => {
                if *stop.borrow() {
                    break;
                }
                warn!(scope = "consumer", consumer = %inner.name(), "delivery stream ended, resubscribing");
                match inner.resubscribe(&mut stop).await {
                    Some((next_channel, next_deliveries)) => {
                        channel = next_channel;
                        deliveries = next_deliveries;
                        flow = inner.channels.flow_state();
                    }
                    None => break,
                }
            }
        }
    }
    info!(scope = "consumer", consumer = %inner.name(), "delivery loop stopped");
}
