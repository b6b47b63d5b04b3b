use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use std::sync::{Mutex, MutexGuard};

/// Fan-out of notifications to any number of subscribers.
///
/// Every subscriber gets its own unbounded stream. Subscribers that dropped
/// their receiver are pruned on the next `notify`; `close` ends every stream,
/// including those subscribed afterwards.
pub(crate) struct Notifier<T> {
    inner: Mutex<Subscribers<T>>,
}

struct Subscribers<T> {
    senders: Vec<UnboundedSender<T>>,
    closed: bool,
}

impl<T: Clone> Notifier<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Subscribers {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }

    pub(crate) fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = unbounded();
        let mut inner = self.lock();
        if !inner.closed {
            inner.senders.push(tx);
        }
        rx
    }

    pub(crate) fn notify(&self, value: T) {
        self.lock()
            .senders
            .retain(|subscriber| subscriber.unbounded_send(value.clone()).is_ok());
    }

    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.senders.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers<T>> {
        // A poisoned list of senders is still a valid list of senders.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}
