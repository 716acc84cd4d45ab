use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use strata_types::{ResourceVersion, StorageResult};

use crate::traits::Store;

/// When and how much history the [`Compactor`] discards.
#[derive(Clone, Debug)]
pub struct CompactionPolicy {
    /// Number of most recent revisions whose history is kept replayable.
    pub retain_revisions: u64,
    /// Interval between passes of the spawned task.
    pub interval: Duration,
    /// Also purge expired objects on each pass.
    pub sweep_expired: bool,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            retain_revisions: 1024,
            interval: Duration::from_secs(60),
            sweep_expired: true,
        }
    }
}

/// Periodically advances the store's retention horizon.
///
/// Live objects are never touched: compaction only bounds the change
/// history, trading replay/reconstruction depth for memory. Watches and
/// continuations that need discarded history fail `Gone` /
/// `InconsistentContinuation` at the store.
pub struct Compactor<S: Store> {
    store: Arc<S>,
    policy: CompactionPolicy,
}

impl<S: Store + 'static> Compactor<S> {
    /// A compactor over the given store.
    pub fn new(store: Arc<S>, policy: CompactionPolicy) -> Self {
        Self { store, policy }
    }

    /// One pass: optional expiry sweep, then advance the horizon so only
    /// the newest `retain_revisions` stay replayable. Returns the version
    /// compacted through (`ZERO` when nothing was discarded).
    pub fn run_once(&self) -> StorageResult<ResourceVersion> {
        if self.policy.sweep_expired {
            self.store.sweep_expired()?;
        }
        let current = self.store.current_rv();
        if current.get() <= self.policy.retain_revisions {
            return Ok(ResourceVersion::ZERO);
        }
        let through = ResourceVersion::new(current.get() - self.policy.retain_revisions);
        self.store.compact(through)?;
        debug!(through = through.get(), "compaction pass complete");
        Ok(through)
    }

    /// Spawn the periodic compaction task on the current tokio runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = self.run_once() {
                    warn!(error = %err, "compaction pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strata_types::{Key, RvMatch, StorageError, WatchOptions, WatchStart};

    use super::*;
    use crate::memory::MemoryStore;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    fn filled_store(n: u64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..n {
            store
                .create(&key(&format!("ns1/obj-{i:03}")), vec![i as u8], None)
                .unwrap();
        }
        store
    }

    #[test]
    fn retention_policy_bounds_replayable_history() {
        let store = filled_store(10);
        let compactor = Compactor::new(
            Arc::clone(&store),
            CompactionPolicy {
                retain_revisions: 3,
                ..CompactionPolicy::default()
            },
        );

        let through = compactor.run_once().unwrap();
        assert_eq!(through, ResourceVersion::new(7));

        // Watching from within the retained window still works...
        assert!(store
            .watch(
                &key("ns1"),
                &WatchOptions {
                    start: WatchStart::AfterRevision(ResourceVersion::new(7)),
                    ..WatchOptions::default()
                },
            )
            .is_ok());

        // ...while older requests fail Gone, and live objects are intact.
        let err = store
            .watch(
                &key("ns1"),
                &WatchOptions {
                    start: WatchStart::AfterRevision(ResourceVersion::new(5)),
                    ..WatchOptions::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::Gone { .. }));
        assert_eq!(store.count(&key("ns1")).unwrap(), 10);
    }

    #[test]
    fn small_stores_are_left_alone() {
        let store = filled_store(5);
        let compactor = Compactor::new(Arc::clone(&store), CompactionPolicy::default());
        assert_eq!(compactor.run_once().unwrap(), ResourceVersion::ZERO);
        assert!(store
            .get(
                &key("ns1/obj-000"),
                RvMatch::Exact(ResourceVersion::new(1))
            )
            .is_ok());
    }

    #[test]
    fn pass_sweeps_expired_objects() {
        let store = Arc::new(MemoryStore::new());
        store
            .create(&key("ns1/ttl"), b"x".to_vec(), Some(Duration::ZERO))
            .unwrap();

        let compactor = Compactor::new(Arc::clone(&store), CompactionPolicy::default());
        compactor.run_once().unwrap();
        assert_eq!(store.count(&key("ns1")).unwrap(), 0);
        // The sweep consumed a version for the purge.
        assert_eq!(store.current_rv(), ResourceVersion::new(2));
    }

    #[tokio::test]
    async fn spawned_task_runs_until_aborted() {
        let store = filled_store(4);
        let compactor = Compactor::new(
            Arc::clone(&store),
            CompactionPolicy {
                retain_revisions: 1,
                interval: Duration::from_millis(5),
                ..CompactionPolicy::default()
            },
        );
        let handle = compactor.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let err = store
            .watch(
                &key("ns1"),
                &WatchOptions {
                    start: WatchStart::AfterRevision(ResourceVersion::new(1)),
                    ..WatchOptions::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::Gone { .. }));
    }
}
