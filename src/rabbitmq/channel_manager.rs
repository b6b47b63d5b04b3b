// src/rabbitmq/channel_manager.rs
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{ConnectionManager, Link, LinkState};
use super::errors::{RabbitMQError, Result};
use super::notify::Notifier;
use super::transport::{ChannelHandle, NotifyStream};

/// Manages one logical channel over a managed connection.
///
/// The channel is opened lazily and replaced when the connection it was
/// opened on is retired, or when the broker closes it.
pub struct ChannelManager {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

struct Shared {
    connection: ConnectionManager,
    /// Only ever locked briefly, never across an await.
    slot: Mutex<Option<ActiveChannel>>,
    /// Held by the one caller opening a replacement channel.
    opening: tokio::sync::Mutex<()>,
    flow: Notifier<bool>,
    flow_state: watch::Sender<bool>,
    closed: AtomicBool,
    closing: watch::Sender<bool>,
}

struct ActiveChannel {
    generation: u64,
    channel: ChannelHandle,
    forwarder: JoinHandle<()>,
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl ChannelManager {
    pub fn new(connection: ConnectionManager) -> Self {
        let states = connection.subscribe_state();
        let shared = Arc::new(Shared {
            connection,
            slot: Mutex::new(None),
            opening: tokio::sync::Mutex::new(()),
            flow: Notifier::new(),
            flow_state: watch::Sender::new(false),
            closed: AtomicBool::new(false),
            closing: watch::Sender::new(false),
        });
        let supervisor = tokio::spawn(supervise(Arc::downgrade(&shared), states));
        Self { shared, supervisor }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.shared.connection
    }

    /// The live channel, opening a new one if the current one is stale.
    pub async fn get_channel(&self) -> Result<ChannelHandle> {
        self.shared.acquire().await
    }

    /// `true` when the broker asks publishers on this channel to pause.
    pub fn notify_flow(&self) -> NotifyStream<bool> {
        self.shared.flow.subscribe()
    }

    pub fn flow_state(&self) -> watch::Receiver<bool> {
        self.shared.flow_state.subscribe()
    }

    /// Closes the channel without waiting for callers still opening one;
    /// those give up with [`RabbitMQError::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.closing.send_replace(true);
        self.supervisor.abort();
        self.shared.flow.close();
        let active = self.shared.slot().take();

        match active {
            Some(active) if active.channel.is_open() => active.channel.close().await,
            _ => Ok(()),
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<ActiveChannel>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn live_channel(&self) -> Option<ChannelHandle> {
        let live_generation = self.connection.current_link().map(|link| link.generation);
        self.slot()
            .as_ref()
            .filter(|active| active.channel.is_open() && Some(active.generation) == live_generation)
            .map(|active| Arc::clone(&active.channel))
    }

    async fn until_closed(&self) {
        let mut closing = self.closing.subscribe();
        // The sender lives as long as `self`.
        let _ = closing.wait_for(|closing| *closing).await;
    }

    async fn acquire(self: &Arc<Self>) -> Result<ChannelHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::Closed);
        }
        if let Some(channel) = self.live_channel() {
            return Ok(channel);
        }

        let _opening = tokio::select! {
            _ = self.until_closed() => return Err(RabbitMQError::Closed),
            guard = self.opening.lock() => guard,
        };
        // Another caller may have opened one while this one waited its turn.
        if let Some(channel) = self.live_channel() {
            return Ok(channel);
        }

        let stale = self.slot().take();
        if let Some(stale) = stale {
            debug!(scope = "channel", generation = stale.generation, "replacing stale channel");
            if stale.channel.is_open() {
                if let Err(err) = stale.channel.close().await {
                    debug!(scope = "channel", error = %err, "closing stale channel failed");
                }
            }
        }

        let (link, channel) = tokio::select! {
            _ = self.until_closed() => return Err(RabbitMQError::Closed),
            opened = self.open() => opened?,
        };
        self.install(&link, &channel).await?;
        debug!(scope = "channel", generation = link.generation, "channel opened");
        Ok(channel)
    }

    async fn open(&self) -> Result<(Link, ChannelHandle)> {
        let link = self.connection.get_link().await?;
        let channel = link.connection.open_channel().await?;
        Ok((link, channel))
    }

    async fn install(self: &Arc<Self>, link: &Link, channel: &ChannelHandle) -> Result<()> {
        {
            let mut slot = self.slot();
            // `close` raises the flag before emptying the slot.
            if !self.closed.load(Ordering::SeqCst) {
                if self.flow_state.send_replace(false) {
                    info!(scope = "channel", "flow reset on new channel");
                    self.flow.notify(false);
                }
                let forwarder =
                    tokio::spawn(forward_flow(Arc::downgrade(self), channel.notify_flow()));
                *slot = Some(ActiveChannel {
                    generation: link.generation,
                    channel: Arc::clone(channel),
                    forwarder,
                });
                return Ok(());
            }
        }

        if let Err(err) = channel.close().await {
            debug!(scope = "channel", error = %err, "closing channel opened during shutdown failed");
        }
        Err(RabbitMQError::Closed)
    }

    fn holds_stale_channel(&self, generation: u64) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|active| active.generation != generation)
    }
}

/// Rebuilds a channel in use as soon as the connection is replaced.
async fn supervise(shared: Weak<Shared>, mut states: watch::Receiver<LinkState>) {
    while states.changed().await.is_ok() {
        let generation = match &*states.borrow_and_update() {
            LinkState::Connected(link) => link.generation,
            _ => continue,
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if shared.holds_stale_channel(generation) {
            match shared.acquire().await {
                Ok(_) => info!(scope = "channel", generation, "channel reopened after reconnect"),
                Err(err) => warn!(scope = "channel", generation, error = %err, "could not reopen channel"),
            }
        }
    }
}

async fn forward_flow(shared: Weak<Shared>, mut flow: NotifyStream<bool>) {
    while let Some(paused) = flow.next().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.flow_state.send_replace(paused);
        shared.flow.notify(paused);
    }
}
