use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use strata_types::{CloseReason, StorageError, StorageResult, WatchEvent};

use crate::broadcaster::Registry;

/// The receiving half of a watch: an ordered, unbounded-length stream of
/// [`WatchEvent`]s, terminated only by cancellation, a lifetime bound, or a
/// buffer overflow.
///
/// Dropping the subscription (or calling [`cancel`](Self::cancel))
/// unregisters it immediately: no further events are delivered and the
/// delivery buffer is released. When the store tears the subscription down,
/// the stream yields exactly one terminal [`WatchEvent::Error`] after the
/// remaining buffered events, then ends.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<WatchEvent>,
    init_rx: watch::Receiver<bool>,
    terminal: Arc<OnceLock<CloseReason>>,
    registry: Weak<Registry>,
    canceled: bool,
    terminal_emitted: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        rx: mpsc::Receiver<WatchEvent>,
        init_rx: watch::Receiver<bool>,
        terminal: Arc<OnceLock<CloseReason>>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            id,
            rx,
            init_rx,
            terminal,
            registry,
            canceled: false,
            terminal_emitted: false,
        }
    }

    /// Registry-local identifier of this subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event, waiting for one to arrive.
    ///
    /// Returns `None` once the stream has ended: after cancellation, or
    /// after the terminal [`WatchEvent::Error`] has been yielded.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        if self.canceled {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(event),
            None => self.take_terminal(),
        }
    }

    /// Receive the next event without waiting.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        if self.canceled {
            return None;
        }
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.take_terminal(),
        }
    }

    /// Wait until the initial snapshot (or replay backlog) has been placed
    /// on this subscription's queue — the boundary between initial sync and
    /// live tail delivery.
    ///
    /// Fails `Canceled` if the subscription is torn down first.
    pub async fn wait_until_initialized(&mut self) -> StorageResult<()> {
        self.init_rx
            .wait_for(|initialized| *initialized)
            .await
            .map(|_| ())
            .map_err(|_| StorageError::Canceled)
    }

    /// Explicit unsubscribe: stop delivery and release the buffer now.
    ///
    /// Events already buffered are discarded; `recv` returns `None` from
    /// here on.
    pub fn cancel(&mut self) {
        if self.canceled {
            return;
        }
        self.canceled = true;
        self.rx.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        debug!(id = self.id, "watch subscription canceled");
    }

    fn take_terminal(&mut self) -> Option<WatchEvent> {
        if self.terminal_emitted {
            return None;
        }
        let reason = *self.terminal.get()?;
        self.terminal_emitted = true;
        Some(WatchEvent::Error(reason))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.canceled {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("canceled", &self.canceled)
            .finish()
    }
}
