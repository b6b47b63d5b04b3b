// src/rabbitmq/connection.rs
use futures::StreamExt;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::amqp_client::LapinTransport;
use super::errors::{RabbitMQError, Result};
use super::notify::Notifier;
use super::transport::{BlockedEvent, CloseEvent, ConnectionHandle, NotifyStream, Transport};
use crate::config::ConnectionConfig;

/// One live connection, tagged with the generation it was installed as.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) generation: u64,
    pub(crate) uri: String,
    pub(crate) connection: ConnectionHandle,
}

#[derive(Clone)]
pub(crate) enum LinkState {
    Disconnected,
    Connecting,
    Connected(Link),
    Closing,
    Failed(Failure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Exhausted { attempts: u32, last_error: String },
    Fatal(String),
}

impl Failure {
    fn to_error(&self) -> RabbitMQError {
        match self {
            Failure::Exhausted {
                attempts,
                last_error,
            } => RabbitMQError::ReconnectExhausted {
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            Failure::Fatal(reason) => RabbitMQError::ConnectError(reason.clone()),
        }
    }
}

/// Lifecycle of a managed connection as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { uri: String },
    Closing,
    Failed,
}

/// Owns one broker connection and replaces it when the broker drops it.
///
/// Clones share the same connection, state and notification streams.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<LinkState>,
    reconnecting: AtomicBool,
    shut_down: AtomicBool,
    next_uri: AtomicUsize,
    generation: AtomicU64,
    closed: Notifier<CloseEvent>,
    blocked: Notifier<BlockedEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state: watch::Sender::new(LinkState::Disconnected),
                reconnecting: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                next_uri: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                closed: Notifier::new(),
                blocked: Notifier::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// A manager that talks to RabbitMQ through lapin.
    pub fn with_lapin(config: ConnectionConfig) -> Result<Self> {
        Self::new(config, Arc::new(LapinTransport::default()))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Opens the first reachable URI, in configured order.
    ///
    /// Only one open runs at a time: a call made while another caller or the
    /// reconnect loop is connecting waits for that outcome instead.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        loop {
            if shared.shut_down.load(Ordering::SeqCst) {
                return Err(RabbitMQError::Closed);
            }
            let claimed = shared.state.send_if_modified(|state| match state {
                LinkState::Disconnected | LinkState::Failed(_) => {
                    *state = LinkState::Connecting;
                    true
                }
                _ => false,
            });
            if claimed {
                return shared.open_first().await;
            }

            match shared.settled().await {
                LinkState::Connected(_) => return Ok(()),
                LinkState::Closing => return Err(RabbitMQError::Closed),
                LinkState::Failed(failure) => return Err(failure.to_error()),
                // The other attempt gave up; try again from here.
                LinkState::Disconnected | LinkState::Connecting => {}
            }
        }
    }

    /// The live connection, waiting out a reconnect in progress.
    pub async fn get_connection(&self) -> Result<ConnectionHandle> {
        Ok(self.get_link().await?.connection)
    }

    pub(crate) async fn get_link(&self) -> Result<Link> {
        let mut state = self.shared.state.subscribe();
        let shut_down = &self.shared.shut_down;
        let wait = async {
            loop {
                let current = state.borrow_and_update().clone();
                match current {
                    // A dead link is about to be replaced by the watcher.
                    LinkState::Connected(link) if link.connection.is_open() => return Ok(link),
                    LinkState::Connected(_) => {}
                    LinkState::Failed(failure) => return Err(failure.to_error()),
                    LinkState::Closing => return Err(RabbitMQError::Closed),
                    LinkState::Disconnected if shut_down.load(Ordering::SeqCst) => {
                        return Err(RabbitMQError::Closed)
                    }
                    LinkState::Disconnected => return Err(RabbitMQError::NotConnected),
                    LinkState::Connecting => {}
                }
                if state.changed().await.is_err() {
                    return Err(RabbitMQError::Closed);
                }
            }
        };

        match self.shared.config.max_wait() {
            Some(limit) => timeout(limit, wait).await.map_err(|_| {
                RabbitMQError::TimeoutError(format!(
                    "no connection became available within {limit:?}"
                ))
            })?,
            None => wait.await,
        }
    }

    /// Yields a `CloseEvent` each time the broker drops the connection.
    pub fn notify_closed(&self) -> NotifyStream<CloseEvent> {
        self.shared.closed.subscribe()
    }

    /// connection.blocked / unblocked, plus an unblock after every reconnect.
    pub fn notify_blocked(&self) -> NotifyStream<BlockedEvent> {
        self.shared.blocked.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        match &*self.shared.state.borrow() {
            LinkState::Disconnected => ConnectionStatus::Disconnected,
            LinkState::Connecting => ConnectionStatus::Connecting,
            LinkState::Connected(link) => ConnectionStatus::Connected {
                uri: link.uri.clone(),
            },
            LinkState::Closing => ConnectionStatus::Closing,
            LinkState::Failed(_) => ConnectionStatus::Failed,
        }
    }

    pub(crate) fn current_link(&self) -> Option<Link> {
        match &*self.shared.state.borrow() {
            LinkState::Connected(link) => Some(link.clone()),
            _ => None,
        }
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Closes the connection and ends every notification stream. A closed
    /// manager does not reconnect and cannot be connected again.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        shared.shut_down.store(true, Ordering::SeqCst);
        let previous = shared.state.send_replace(LinkState::Closing);
        shared.abort_tasks();
        shared.reconnecting.store(false, Ordering::SeqCst);

        let result = match previous {
            LinkState::Connected(link) => {
                info!(scope = "connection", uri = %link.uri, "closing connection");
                link.connection.close().await
            }
            _ => Ok(()),
        };

        shared.state.send_replace(LinkState::Disconnected);
        shared.closed.close();
        shared.blocked.close();
        result
    }
}

impl Shared {
    /// Runs with the state claimed as `Connecting` by the caller.
    async fn open_first(self: &Arc<Self>) -> Result<()> {
        let mut last_error = String::new();
        for (index, uri) in self.config.uris.iter().enumerate() {
            info!(scope = "connection", %uri, "connecting to broker");
            match self.open(uri).await {
                Ok(connection) => {
                    if self.shut_down.load(Ordering::SeqCst) {
                        if let Err(err) = connection.close().await {
                            debug!(scope = "connection", error = %err, "discarding connection opened during close");
                        }
                        return Err(RabbitMQError::Closed);
                    }
                    self.next_uri.store(index + 1, Ordering::SeqCst);
                    self.install(uri, connection);
                    return Ok(());
                }
                Err(err) if !err.is_retryable() => {
                    error!(scope = "connection", %uri, error = %err, "connection refused permanently");
                    self.settle_disconnected();
                    return Err(err);
                }
                Err(err) => {
                    warn!(scope = "connection", %uri, error = %err, "broker unreachable, trying next");
                    last_error = format!("{uri}: {err}");
                }
            }
        }

        self.settle_disconnected();
        Err(RabbitMQError::ConnectError(format!(
            "none of {} broker URIs accepted a connection (last error: {last_error})",
            self.config.uris.len()
        )))
    }

    /// Back to `Disconnected`, unless `close` took over meanwhile.
    fn settle_disconnected(&self) {
        self.state.send_if_modified(|state| {
            let connecting = matches!(state, LinkState::Connecting);
            if connecting {
                *state = LinkState::Disconnected;
            }
            connecting
        });
    }

    /// The first state that is not `Connecting`.
    async fn settled(&self) -> LinkState {
        let mut state = self.state.subscribe();
        let settled = match state
            .wait_for(|state| !matches!(state, LinkState::Connecting))
            .await
        {
            Ok(settled) => settled.clone(),
            Err(_) => LinkState::Closing,
        };
        settled
    }

    async fn open(&self, uri: &str) -> Result<ConnectionHandle> {
        timeout(self.config.connect_timeout, self.transport.open(uri)).await?
    }

    fn install(self: &Arc<Self>, uri: &str, connection: ConnectionHandle) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let closed = connection.notify_closed();
        let blocked = connection.notify_blocked();
        let watcher = tokio::spawn(watch_connection(
            Arc::downgrade(self),
            generation,
            connection.clone(),
            closed,
            blocked,
        ));
        self.track(watcher);

        self.state.send_replace(LinkState::Connected(Link {
            generation,
            uri: uri.to_string(),
            connection,
        }));
        info!(scope = "connection", %uri, generation, "connected to broker");
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(&*self.state.borrow(), LinkState::Connected(link) if link.generation == generation)
    }

    fn on_connection_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let lost = self.state.send_if_modified(|state| {
            let current =
                matches!(state, LinkState::Connected(link) if link.generation == generation);
            if current {
                *state = LinkState::Connecting;
            }
            current
        });
        if !lost {
            debug!(scope = "connection", generation, "ignoring close of a retired connection");
            return;
        }

        warn!(scope = "connection", generation, %reason, "connection lost");
        self.closed.notify(CloseEvent { reason });
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(scope = "connection", "reconnect already in progress");
            return;
        }
        let task = tokio::spawn(reconnect(Arc::downgrade(self)));
        self.track(task);
    }

    fn fail(&self, failure: Failure) {
        self.reconnecting.store(false, Ordering::SeqCst);
        self.state.send_replace(LinkState::Failed(failure));
    }

    fn next_uri(&self) -> String {
        let uris = &self.config.uris;
        let index = self.next_uri.fetch_add(1, Ordering::SeqCst) % uris.len();
        uris.get(index).cloned().unwrap_or_default()
    }

    fn backoff(&self) -> Duration {
        let interval = self.config.reconnect_interval;
        let jitter = self.config.reconnect_jitter;
        if jitter > 0.0 {
            interval.mul_f64(1.0 + rand::rng().random_range(0.0..jitter))
        } else {
            interval
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn watch_connection(
    shared: Weak<Shared>,
    generation: u64,
    connection: ConnectionHandle,
    closed: NotifyStream<CloseEvent>,
    blocked: NotifyStream<BlockedEvent>,
) {
    let reason = if connection.is_open() {
        drop(connection);
        match wait_for_close(&shared, generation, closed, blocked).await {
            Some(reason) => reason,
            None => return,
        }
    } else {
        "connection closed before it was watched".to_string()
    };

    if let Some(shared) = shared.upgrade() {
        shared.on_connection_lost(generation, reason);
    }
}

/// Relays blocked events until the connection closes; `None` once the manager is gone.
async fn wait_for_close(
    shared: &Weak<Shared>,
    generation: u64,
    mut closed: NotifyStream<CloseEvent>,
    mut blocked: NotifyStream<BlockedEvent>,
) -> Option<String> {
    let mut blocked_open = true;
    loop {
        tokio::select! {
            event = closed.next() => {
                return Some(event.map(|e| e.reason).unwrap_or_else(|| "connection closed".to_string()));
            }
            event = blocked.next(), if blocked_open => match event {
                Some(event) => {
                    let shared = shared.upgrade()?;
                    if shared.is_current(generation) {
                        debug!(scope = "connection", generation, active = event.active, "blocked notification");
                        shared.blocked.notify(event);
                    }
                }
                None => blocked_open = false,
            },
        }
    }
}

async fn reconnect(weak: Weak<Shared>) {
    let mut attempt: u32 = 0;
    let mut last_error = String::from("connection lost");

    loop {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if !matches!(*shared.state.borrow(), LinkState::Connecting) {
            shared.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        if let Some(max) = shared.config.max_attempts() {
            if attempt >= max {
                error!(
                    scope = "connection",
                    attempts = attempt,
                    %last_error,
                    "giving up on reconnecting"
                );
                shared.fail(Failure::Exhausted {
                    attempts: attempt,
                    last_error,
                });
                return;
            }
        }

        attempt += 1;
        sleep(shared.backoff()).await;
        let uri = shared.next_uri();
        info!(scope = "connection", attempt, %uri, "reconnecting");

        match shared.open(&uri).await {
            Ok(connection) => {
                if !matches!(*shared.state.borrow(), LinkState::Connecting) {
                    shared.reconnecting.store(false, Ordering::SeqCst);
                    if let Err(err) = connection.close().await {
                        debug!(scope = "connection", error = %err, "discarding late connection");
                    }
                    return;
                }
                shared.reconnecting.store(false, Ordering::SeqCst);
                shared.install(&uri, connection);
                shared.blocked.notify(BlockedEvent::unblocked());
                info!(scope = "connection", attempt, %uri, "reconnected");
                return;
            }
            Err(err) if !err.is_retryable() => {
                error!(scope = "connection", %uri, error = %err, "reconnect refused permanently");
                shared.fail(Failure::Fatal(format!("{uri}: {err}")));
                return;
            }
            Err(err) => {
                warn!(scope = "connection", attempt, %uri, error = %err, "reconnect attempt failed");
                last_error = format!("{uri}: {err}");
            }
        }
    }
}
