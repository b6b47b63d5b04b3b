// src/rabbitmq/memory.rs
// In-process broker for tests and local runs without RabbitMQ.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::errors::{RabbitMQError, Result};
use super::notify::Notifier;
use super::transport::{
    BlockedEvent, BrokerChannel, BrokerConnection, ChannelHandle, CloseEvent, ConnectionHandle,
    DeliveryStream, NotifyStream, Transport,
};
use crate::config::{ConsumerConfig, ExchangeConfig, ExchangeKind, QueueBindConfig, QueueConfig};
use crate::message::MessageEnvelope;

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: MessageEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosSettings {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

/// Shared broker state. Clones observe and control the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeConfig>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBindConfig>,
    connections: Vec<Arc<ConnectionShared>>,
    channels: Vec<Arc<ChannelShared>>,
    unacked: HashMap<u64, Unacked>,
    unreachable_uris: HashSet<String>,
    rejected_uris: HashSet<String>,
    failing_opens: u32,
    open_latency: Duration,
    open_attempts: Vec<String>,
    published: Vec<PublishedMessage>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    qos: Vec<QosSettings>,
    next_delivery_tag: u64,
    next_id: u64,
}

struct MemoryQueue {
    config: QueueConfig,
    ready: VecDeque<MessageEnvelope>,
    consumers: Vec<ConsumerSlot>,
}

struct ConsumerSlot {
    channel_id: u64,
    auto_ack: bool,
    tx: UnboundedSender<Result<MessageEnvelope>>,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    envelope: MessageEnvelope,
}

struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    closed: Notifier<CloseEvent>,
    blocked: Notifier<BlockedEvent>,
}

struct ChannelShared {
    id: u64,
    connection_id: u64,
    open: AtomicBool,
    flow: Notifier<bool>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn close_channel(&mut self, channel: &ChannelShared) {
        channel.open.store(false, Ordering::SeqCst);
        channel.flow.close();
        self.channels.retain(|c| c.id != channel.id);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel_id != channel.id);
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == channel.id)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so the oldest delivery ends up at the front again.
        orphaned.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = BTreeSet::new();
        for tag in orphaned {
            if let Some(unacked) = self.unacked.remove(&tag) {
                touched.insert(unacked.queue.clone());
                self.requeue(&unacked.queue, unacked.envelope);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection: &ConnectionShared, event: Option<CloseEvent>) {
        connection.open.store(false, Ordering::SeqCst);
        self.connections.retain(|c| c.id != connection.id);
        let channels: Vec<Arc<ChannelShared>> = self
            .channels
            .iter()
            .filter(|c| c.connection_id == connection.id)
            .cloned()
            .collect();
        for channel in channels {
            self.close_channel(&channel);
        }
        if let Some(event) = event {
            connection.closed.notify(event);
        }
        connection.closed.close();
        connection.blocked.close();
    }

    fn requeue(&mut self, queue: &str, mut envelope: MessageEnvelope) {
        if let Some(queue) = self.queues.get_mut(queue) {
            envelope.redelivered = true;
            queue.ready.push_front(envelope);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default();
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .unwrap_or(ExchangeKind::Direct);
        let mut targets = BTreeSet::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.binding_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.binding_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if matched {
                targets.insert(binding.queue.clone());
            }
        }
        targets.into_iter().collect()
    }

    /// Hands ready messages to the queue's consumers, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let tag = self.next_delivery_tag + 1;
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.consumers.retain(|slot| !slot.tx.is_closed());
            let Some((channel_id, auto_ack, tx)) = queue
                .consumers
                .first()
                .map(|slot| (slot.channel_id, slot.auto_ack, slot.tx.clone()))
            else {
                return;
            };
            let Some(mut envelope) = queue.ready.pop_front() else {
                return;
            };
            queue.consumers.rotate_left(1);

            envelope.delivery_tag = tag;
            if tx.unbounded_send(Ok(envelope.clone())).is_err() {
                queue.ready.push_front(envelope);
                continue;
            }

            self.next_delivery_tag = tag;
            if !auto_ack {
                self.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        channel_id,
                        envelope,
                    },
                );
            }
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || key.split_first().is_some_and(|(_, tail)| matches(pattern, tail))
            }
            (Some((&"*", rest)), Some((_, tail))) => matches(rest, tail),
            (Some((word, rest)), Some((candidate, tail))) => word == candidate && matches(rest, tail),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn precondition_failed(what: &str) -> RabbitMQError {
    RabbitMQError::DeclareError(format!(
        "PRECONDITION_FAILED - inequivalent arguments for {what}"
    ))
}

fn not_found(what: &str) -> RabbitMQError {
    RabbitMQError::DeclareError(format!("NOT_FOUND - no {what}"))
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose connections land on this broker.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            broker: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opening `uri` fails with a transient connection error until restored.
    pub fn refuse_uri(&self, uri: &str) {
        self.lock().unreachable_uris.insert(uri.to_string());
    }

    /// Opening `uri` fails with an authentication error.
    pub fn reject_uri(&self, uri: &str) {
        self.lock().rejected_uris.insert(uri.to_string());
    }

    pub fn restore_uri(&self, uri: &str) {
        let mut state = self.lock();
        state.unreachable_uris.remove(uri);
        state.rejected_uris.remove(uri);
    }

    /// The next `count` opens fail with a transient error, whatever the URI.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Every open takes `latency` before the broker answers, like a slow handshake.
    pub fn set_open_latency(&self, latency: Duration) {
        self.lock().open_latency = latency;
    }

    /// Server-initiated close of every live connection.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.lock();
        let connections = state.connections.clone();
        for connection in connections {
            state.close_connection(
                &connection,
                Some(CloseEvent {
                    reason: reason.to_string(),
                }),
            );
        }
    }

    /// connection.blocked (`true`) / connection.unblocked (`false`) on every live connection.
    pub fn set_blocked(&self, active: bool) {
        let state = self.lock();
        for connection in &state.connections {
            connection.blocked.notify(if active {
                BlockedEvent::blocked("low on resources")
            } else {
                BlockedEvent::unblocked()
            });
        }
    }

    /// channel.flow on every open channel; `true` pauses publishers.
    pub fn set_flow(&self, paused: bool) {
        let state = self.lock();
        for channel in &state.channels {
            channel.flow.notify(paused);
        }
    }

    /// Enqueues a message directly, as if it had been routed to `queue`.
    pub fn deliver(&self, queue: &str, envelope: MessageEnvelope) {
        let mut state = self.lock();
        if let Some(target) = state.queues.get_mut(queue) {
            target.ready.push_back(MessageEnvelope {
                routing_key: queue.to_string(),
                ..envelope
            });
        }
        state.dispatch(queue);
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts.len()
    }

    pub fn open_attempt_uris(&self) -> Vec<String> {
        self.lock().open_attempts.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|message| message.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Messages waiting in `name` that no consumer holds.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|queue| queue.ready.len())
            .unwrap_or(0)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacks.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn qos_history(&self) -> Vec<QosSettings> {
        self.lock().qos.clone()
    }
}

struct MemoryTransport {
    broker: MemoryBroker,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, uri: &str) -> Result<ConnectionHandle> {
        let latency = {
            let mut state = self.broker.lock();
            state.open_attempts.push(uri.to_string());
            state.open_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.broker.lock();

        if state.rejected_uris.contains(uri) {
            return Err(RabbitMQError::AuthError(format!(
                "ACCESS_REFUSED - login refused for {uri}"
            )));
        }
        if state.unreachable_uris.contains(uri) {
            return Err(RabbitMQError::ConnectionError(format!(
                "connection refused: {uri}"
            )));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(RabbitMQError::ConnectionError(format!(
                "connection reset while opening {uri}"
            )));
        }

        let shared = Arc::new(ConnectionShared {
            id: state.next_id(),
            open: AtomicBool::new(true),
            closed: Notifier::new(),
            blocked: Notifier::new(),
        });
        state.connections.push(Arc::clone(&shared));
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            shared,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<ChannelHandle> {
        if !self.is_open() {
            return Err(RabbitMQError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        let mut state = self.broker.lock();
        let channel = Arc::new(ChannelShared {
            id: state.next_id(),
            connection_id: self.shared.id,
            open: AtomicBool::new(true),
            flow: Notifier::new(),
        });
        state.channels.push(Arc::clone(&channel));
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: Arc::clone(&self.shared),
            shared: channel,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_connection(&self.shared, None);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn notify_closed(&self) -> NotifyStream<CloseEvent> {
        self.shared.closed.subscribe()
    }

    fn notify_blocked(&self) -> NotifyStream<BlockedEvent> {
        self.shared.blocked.subscribe()
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection: Arc<ConnectionShared>,
    shared: Arc<ChannelShared>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel is closed".to_string()))
        }
    }

    /// Channel-level exceptions close the channel, as a real broker would.
    fn fail(&self, state: &mut BrokerState, err: RabbitMQError) -> RabbitMQError {
        state.close_channel(&self.shared);
        err
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && self.connection.open.load(Ordering::SeqCst)
    }

    fn notify_flow(&self) -> NotifyStream<bool> {
        self.shared.flow.subscribe()
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let equivalent = state.exchanges.get(&exchange.name).map(|e| e == exchange);
        match equivalent {
            Some(true) => Ok(()),
            Some(false) => {
                let err = precondition_failed(&format!("exchange '{}'", exchange.name));
                Err(self.fail(&mut state, err))
            }
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let equivalent = state.queues.get(&queue.name).map(|q| q.config == *queue);
        match equivalent {
            Some(true) => Ok(()),
            Some(false) => {
                let err = precondition_failed(&format!("queue '{}'", queue.name));
                Err(self.fail(&mut state, err))
            }
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        config: queue.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBindConfig) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(&binding.queue) {
            let err = not_found(&format!("queue '{}'", binding.queue));
            return Err(self.fail(&mut state, err));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            let err = not_found(&format!("exchange '{}'", binding.exchange));
            return Err(self.fail(&mut state, err));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            let err = not_found(&format!("exchange '{exchange}'"));
            return Err(self.fail(&mut state, err));
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        });

        for queue in state.route(exchange, routing_key) {
            if let Some(target) = state.queues.get_mut(&queue) {
                target.ready.push_back(MessageEnvelope {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    delivery_tag: 0,
                    redelivered: false,
                    ..envelope.clone()
                });
            }
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer: &ConsumerConfig) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            let err = not_found(&format!("queue '{queue}'"));
            return Err(self.fail(&mut state, err));
        }
        let (tx, rx) = unbounded();
        if let Some(target) = state.queues.get_mut(queue) {
            target.consumers.push(ConsumerSlot {
                channel_id: self.shared.id,
                auto_ack: consumer.auto_ack,
                tx,
            });
        }
        state.dispatch(queue);
        Ok(rx.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.acks.push(delivery_tag);
        match state.unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(RabbitMQError::AckError(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.nacks.push((delivery_tag, requeue));
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(RabbitMQError::AckError(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };
        if requeue {
            state.requeue(&unacked.queue, unacked.envelope);
            state.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().qos.push(QosSettings {
            prefetch_count,
            prefetch_size,
            global,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(&self.shared);
        Ok(())
    }
}
