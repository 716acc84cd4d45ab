use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use strata_types::{
    CloseReason, Key, Predicate, RawObject, ResourceVersion, WatchEvent, WatchOptions,
};

use crate::subscription::Subscription;

/// Configuration for the [`Broadcaster`].
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Capacity of each subscription's delivery queue.
    pub buffer_capacity: usize,
    /// Interval between synthetic bookmark events for opted-in subscribers.
    pub bookmark_interval: Duration,
    /// Maximum subscription lifetime; exceeded subscriptions are closed
    /// with a terminal `Error(TimedOut)` event. `None` disables the bound.
    pub max_lifetime: Option<Duration>,
    /// How often the spawned maintenance task runs.
    pub maintenance_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            bookmark_interval: Duration::from_secs(60),
            max_lifetime: Some(Duration::from_secs(300)),
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

/// One committed mutation, as routed to the broadcaster.
///
/// `prev` is the object state before the mutation (stamped with its old
/// version); `current` is the state after it (stamped with `rv`), or `None`
/// for a deletion. The pair is what lets each subscription translate the
/// same mutation into `Added`, `Modified`, or `Deleted` relative to its own
/// predicate.
#[derive(Clone, Debug)]
pub struct Change {
    /// Version consumed by this mutation.
    pub rv: ResourceVersion,
    /// Key the mutation applied to.
    pub key: Key,
    /// State before the mutation, if the key was live.
    pub prev: Option<RawObject>,
    /// State after the mutation; `None` for deletions.
    pub current: Option<RawObject>,
}

impl Change {
    /// Translate this change into the event a subscription with the given
    /// predicate should observe, if any.
    pub fn event_for(&self, predicate: &Predicate) -> Option<WatchEvent> {
        let prev_pass = self.prev.as_ref().is_some_and(|o| predicate.matches(o));
        let curr_pass = self.current.as_ref().is_some_and(|o| predicate.matches(o));
        match (curr_pass, prev_pass) {
            (true, false) => Some(WatchEvent::Added(self.current.clone()?)),
            (true, true) => Some(WatchEvent::Modified(self.current.clone()?)),
            // The object left this subscription's view, by deletion or by
            // no longer matching: deliver its prior state restamped with
            // the mutation's version.
            (false, true) => Some(WatchEvent::Deleted(self.prev.as_ref()?.with_rv(self.rv))),
            (false, false) => None,
        }
    }
}

/// Internal subscriber slot: scope, filter, and the sending half of the
/// subscription's bounded queue.
struct Slot {
    id: u64,
    key: Key,
    recursive: bool,
    predicate: Predicate,
    bookmarks: bool,
    tx: mpsc::Sender<WatchEvent>,
    terminal: Arc<OnceLock<CloseReason>>,
    // Keeps the init signal alive for `wait_until_initialized`.
    init_tx: watch::Sender<bool>,
    opened_at: Instant,
    last_bookmark: Instant,
}

impl Slot {
    fn covers(&self, key: &Key) -> bool {
        if self.recursive {
            self.key.contains(key)
        } else {
            &self.key == key
        }
    }

    /// Non-blocking send. Returns `false` when the slot must be removed
    /// (buffer overflow or receiver gone).
    fn deliver(&self, event: WatchEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id = self.id, "subscription buffer overflowed, closing");
                let _ = self.terminal.set(CloseReason::Overflowed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub(crate) struct Registry {
    pub(crate) slots: Mutex<Vec<Slot>>,
    latest_rv: AtomicU64,
    next_id: AtomicU64,
    config: WatchConfig,
}

impl Registry {
    pub(crate) fn remove(&self, id: u64) {
        self.slots
            .lock()
            .expect("registry lock poisoned")
            .retain(|slot| slot.id != id);
    }
}

/// Fan-out router delivering committed mutations to matching subscriptions.
///
/// The store calls [`route`](Broadcaster::route) inside its commit critical
/// section; all sends are non-blocking, so a writer is never throttled by a
/// consumer. Subscription bookkeeping (bookmarks, lifetimes) runs from
/// [`tick`](Broadcaster::tick), either driven manually or by
/// [`spawn_maintenance`](Broadcaster::spawn_maintenance).
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    /// Create a broadcaster with the given configuration.
    pub fn new(config: WatchConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                slots: Mutex::new(Vec::new()),
                latest_rv: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Register a new subscription.
    ///
    /// `backlog` is pre-seeded into the queue before any live event can
    /// arrive: the initial snapshot for `WatchStart::InitialSnapshot`, or
    /// replayed history for `WatchStart::AfterRevision`. The caller must
    /// hold its state lock across this call so no mutation lands between
    /// building the backlog and registering the slot. `current_rv` is the
    /// newest committed version as of registration, used for bookmarks
    /// until the first live event.
    pub fn subscribe(
        &self,
        key: Key,
        options: &WatchOptions,
        backlog: Vec<WatchEvent>,
        current_rv: ResourceVersion,
    ) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .latest_rv
            .fetch_max(current_rv.get(), Ordering::Relaxed);

        // Leave room for the whole backlog even when it exceeds the
        // configured capacity; live-tail overflow still applies afterwards.
        let capacity = self.registry.config.buffer_capacity.max(backlog.len() + 1);
        let (tx, rx) = mpsc::channel(capacity);
        let (init_tx, init_rx) = watch::channel(false);
        let terminal = Arc::new(OnceLock::new());
        let now = Instant::now();

        let slot = Slot {
            id,
            key,
            recursive: options.recursive,
            predicate: options.predicate.clone(),
            bookmarks: options.bookmarks,
            tx,
            terminal: Arc::clone(&terminal),
            init_tx,
            opened_at: now,
            last_bookmark: now,
        };

        for event in backlog {
            // Capacity is sized for the backlog; a failure here means the
            // receiver is already gone.
            if !slot.deliver(event) {
                break;
            }
        }
        slot.init_tx.send_replace(true);

        debug!(id, "watch subscription registered");
        self.registry
            .slots
            .lock()
            .expect("registry lock poisoned")
            .push(slot);

        Subscription::new(id, rx, init_rx, terminal, Arc::downgrade(&self.registry))
    }

    /// Route one committed mutation to every matching subscription.
    ///
    /// Slots whose consumer lags (queue full) or disappeared are removed;
    /// overflowed slots get a terminal `Error(Overflowed)` once their
    /// remaining buffered events are drained.
    pub fn route(&self, change: &Change) {
        self.registry
            .latest_rv
            .fetch_max(change.rv.get(), Ordering::Relaxed);

        let mut slots = self.registry.slots.lock().expect("registry lock poisoned");
        slots.retain(|slot| {
            if !slot.covers(&change.key) {
                return !slot.tx.is_closed();
            }
            match change.event_for(&slot.predicate) {
                Some(event) => {
                    trace!(id = slot.id, rv = change.rv.get(), "watch delivery");
                    slot.deliver(event)
                }
                None => !slot.tx.is_closed(),
            }
        });
    }

    /// Send an on-demand progress bookmark carrying the newest committed
    /// version to every bookmark-opted subscription.
    pub fn request_progress(&self) {
        let rv = ResourceVersion::new(self.registry.latest_rv.load(Ordering::Relaxed));
        let mut slots = self.registry.slots.lock().expect("registry lock poisoned");
        slots.retain(|slot| {
            if slot.bookmarks {
                slot.deliver(WatchEvent::Bookmark(rv))
            } else {
                !slot.tx.is_closed()
            }
        });
    }

    /// One maintenance pass at the given instant: close subscriptions past
    /// their maximum lifetime and emit periodic bookmarks. Exposed for
    /// deterministic tests; production drives it from
    /// [`spawn_maintenance`](Self::spawn_maintenance).
    pub fn tick(&self, now: Instant) {
        let config = self.registry.config.clone();
        let rv = ResourceVersion::new(self.registry.latest_rv.load(Ordering::Relaxed));
        let mut slots = self.registry.slots.lock().expect("registry lock poisoned");
        slots.retain_mut(|slot| {
            if let Some(max) = config.max_lifetime {
                if now.duration_since(slot.opened_at) >= max {
                    debug!(id = slot.id, "subscription exceeded max lifetime, closing");
                    let _ = slot.terminal.set(CloseReason::TimedOut);
                    return false;
                }
            }
            if slot.bookmarks && now.duration_since(slot.last_bookmark) >= config.bookmark_interval
            {
                slot.last_bookmark = now;
                return slot.deliver(WatchEvent::Bookmark(rv));
            }
            !slot.tx.is_closed()
        });
    }

    /// Spawn the periodic maintenance task on the current tokio runtime.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        let period = broadcaster.registry.config.maintenance_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                broadcaster.tick(Instant::now());
            }
        })
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .slots
            .lock()
            .expect("registry lock poisoned")
            .len()
    }

    /// The newest version observed by the broadcaster.
    pub fn latest_rv(&self) -> ResourceVersion {
        ResourceVersion::new(self.registry.latest_rv.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscriber_count())
            .field("latest_rv", &self.latest_rv())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::WatchStart;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    fn object(raw: &str, data: &[u8], rv: u64) -> RawObject {
        RawObject {
            key: key(raw),
            data: data.to_vec(),
            rv: ResourceVersion::new(rv),
        }
    }

    fn create_change(raw: &str, data: &[u8], rv: u64) -> Change {
        Change {
            rv: ResourceVersion::new(rv),
            key: key(raw),
            prev: None,
            current: Some(object(raw, data, rv)),
        }
    }

    fn watch_all() -> WatchOptions {
        WatchOptions {
            recursive: true,
            start: WatchStart::LiveOnly,
            predicate: Predicate::everything(),
            bookmarks: false,
        }
    }

    #[test]
    fn live_events_reach_matching_subscription() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let mut sub = broadcaster.subscribe(
            key("ns1"),
            &watch_all(),
            Vec::new(),
            ResourceVersion::ZERO,
        );

        broadcaster.route(&create_change("ns1/a", b"a", 1));
        broadcaster.route(&create_change("ns2/b", b"b", 2));

        let event = sub.try_recv().unwrap();
        assert!(matches!(event, WatchEvent::Added(ref o) if o.key.as_str() == "ns1/a"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn non_recursive_scope_addresses_one_key() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let options = WatchOptions {
            recursive: false,
            ..watch_all()
        };
        let mut sub =
            broadcaster.subscribe(key("ns1/a"), &options, Vec::new(), ResourceVersion::ZERO);

        broadcaster.route(&create_change("ns1/a/nested", b"x", 1));
        broadcaster.route(&create_change("ns1/a", b"y", 2));

        let event = sub.try_recv().unwrap();
        assert_eq!(event.resource_version(), Some(ResourceVersion::new(2)));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn update_translates_per_predicate() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let options = WatchOptions {
            predicate: Predicate::from_fn(|o| o.data.starts_with(b"keep")),
            ..watch_all()
        };
        let mut sub = broadcaster.subscribe(key("ns1"), &options, Vec::new(), ResourceVersion::ZERO);

        // Enters the view: Added.
        broadcaster.route(&Change {
            rv: ResourceVersion::new(2),
            key: key("ns1/a"),
            prev: Some(object("ns1/a", b"drop", 1)),
            current: Some(object("ns1/a", b"keep v2", 2)),
        });
        // Stays in view: Modified.
        broadcaster.route(&Change {
            rv: ResourceVersion::new(3),
            key: key("ns1/a"),
            prev: Some(object("ns1/a", b"keep v2", 2)),
            current: Some(object("ns1/a", b"keep v3", 3)),
        });
        // Leaves the view without being deleted: Deleted, restamped.
        broadcaster.route(&Change {
            rv: ResourceVersion::new(4),
            key: key("ns1/a"),
            prev: Some(object("ns1/a", b"keep v3", 3)),
            current: Some(object("ns1/a", b"drop v4", 4)),
        });

        assert!(matches!(sub.try_recv().unwrap(), WatchEvent::Added(_)));
        assert!(matches!(sub.try_recv().unwrap(), WatchEvent::Modified(_)));
        match sub.try_recv().unwrap() {
            WatchEvent::Deleted(o) => {
                assert_eq!(o.rv, ResourceVersion::new(4));
                assert_eq!(o.data, b"keep v3");
            }
            other => panic!("expected Deleted, got {other:?}"),
        }
    }

    #[test]
    fn backlog_is_delivered_before_live_tail() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let backlog = vec![
            WatchEvent::Added(object("ns1/a", b"a", 1)),
            WatchEvent::Added(object("ns1/b", b"b", 2)),
        ];
        let mut sub =
            broadcaster.subscribe(key("ns1"), &watch_all(), backlog, ResourceVersion::new(2));
        broadcaster.route(&create_change("ns1/c", b"c", 3));

        let versions: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.resource_version().unwrap().get())
            .collect();
        assert_eq!(versions, [1, 2, 3]);
    }

    #[test]
    fn overflow_terminates_with_error_event() {
        let config = WatchConfig {
            buffer_capacity: 2,
            ..WatchConfig::default()
        };
        let broadcaster = Broadcaster::new(config);
        let mut sub = broadcaster.subscribe(
            key("ns1"),
            &watch_all(),
            Vec::new(),
            ResourceVersion::ZERO,
        );

        for rv in 1..=3 {
            broadcaster.route(&create_change("ns1/a", b"x", rv));
        }
        assert_eq!(broadcaster.subscriber_count(), 0);

        // Buffered events drain first, then the terminal error.
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
        assert!(matches!(
            sub.try_recv(),
            Some(WatchEvent::Error(CloseReason::Overflowed))
        ));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn bookmark_tick_delivers_latest_rv() {
        let config = WatchConfig {
            bookmark_interval: Duration::from_secs(10),
            max_lifetime: None,
            ..WatchConfig::default()
        };
        let broadcaster = Broadcaster::new(config);
        let options = WatchOptions {
            bookmarks: true,
            ..watch_all()
        };
        let mut with_bookmarks =
            broadcaster.subscribe(key("ns1"), &options, Vec::new(), ResourceVersion::ZERO);
        let mut without = broadcaster.subscribe(
            key("ns1"),
            &watch_all(),
            Vec::new(),
            ResourceVersion::ZERO,
        );

        broadcaster.route(&create_change("ns2/x", b"x", 7));

        let now = Instant::now();
        broadcaster.tick(now); // Interval not yet elapsed.
        assert!(with_bookmarks.try_recv().is_none());

        broadcaster.tick(now + Duration::from_secs(11));
        assert!(matches!(
            with_bookmarks.try_recv(),
            Some(WatchEvent::Bookmark(rv)) if rv.get() == 7
        ));
        assert!(without.try_recv().is_none());
    }

    #[test]
    fn lifetime_bound_closes_with_timeout() {
        let config = WatchConfig {
            max_lifetime: Some(Duration::from_secs(30)),
            ..WatchConfig::default()
        };
        let broadcaster = Broadcaster::new(config);
        let mut sub = broadcaster.subscribe(
            key("ns1"),
            &watch_all(),
            Vec::new(),
            ResourceVersion::ZERO,
        );

        broadcaster.tick(Instant::now() + Duration::from_secs(31));
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(matches!(
            sub.try_recv(),
            Some(WatchEvent::Error(CloseReason::TimedOut))
        ));
    }

    #[test]
    fn request_progress_reaches_opted_in_subscribers() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let options = WatchOptions {
            bookmarks: true,
            ..watch_all()
        };
        let mut sub =
            broadcaster.subscribe(key("ns1"), &options, Vec::new(), ResourceVersion::new(5));

        broadcaster.request_progress();
        assert!(matches!(
            sub.try_recv(),
            Some(WatchEvent::Bookmark(rv)) if rv.get() == 5
        ));
    }

    #[test]
    fn cancel_stops_delivery_and_unregisters() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let mut sub = broadcaster.subscribe(
            key("ns1"),
            &watch_all(),
            Vec::new(),
            ResourceVersion::ZERO,
        );
        broadcaster.route(&create_change("ns1/a", b"a", 1));

        sub.cancel();
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(sub.try_recv().is_none());

        // Routing after cancel delivers nothing and does not panic.
        broadcaster.route(&create_change("ns1/b", b"b", 2));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropped_subscription_is_pruned_on_route() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let sub = broadcaster.subscribe(
            key("ns1"),
            &watch_all(),
            Vec::new(),
            ResourceVersion::ZERO,
        );
        drop(sub);
        broadcaster.route(&create_change("ns1/a", b"a", 1));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn async_recv_sees_live_events() {
        let broadcaster = Broadcaster::new(WatchConfig::default());
        let mut sub = broadcaster.subscribe(
            key("ns1"),
            &watch_all(),
            Vec::new(),
            ResourceVersion::ZERO,
        );
        sub.wait_until_initialized().await.unwrap();

        broadcaster.route(&create_change("ns1/a", b"a", 1));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.resource_version(), Some(ResourceVersion::new(1)));
    }
}
