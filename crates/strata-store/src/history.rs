use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use strata_types::{Key, RawObject, ResourceVersion, StorageError, StorageResult};
use strata_watch::Change;

/// Bounded, ordered log of committed mutations.
///
/// Records serve two consumers: forward replay for watches resuming from an
/// older version, and reverse application for reconstructing the keyspace
/// as of a past version (exact-version reads and strict continuation
/// paging). The log is bounded two ways — an explicit
/// [`compact`](Self::compact) call and a hard capacity cap — and either one
/// advances the retention horizon.
#[derive(Debug)]
pub struct History {
    records: VecDeque<Change>,
    /// Oldest version whose record is still retained. Replay and
    /// reconstruction are possible for any version `v` with
    /// `v + 1 >= horizon`.
    horizon: ResourceVersion,
    capacity: usize,
}

impl History {
    /// Empty history retaining at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self::with_horizon(capacity, ResourceVersion::new(1))
    }

    /// Empty history whose retention starts at `horizon` (used by backends
    /// that recover live state but not mutation history).
    pub fn with_horizon(capacity: usize, horizon: ResourceVersion) -> Self {
        Self {
            records: VecDeque::new(),
            horizon,
            capacity,
        }
    }

    /// Oldest version still replayable from this history.
    pub fn horizon(&self) -> ResourceVersion {
        self.horizon
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when no records are retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append the record of a just-committed mutation. Records must arrive
    /// in version order. The capacity cap may advance the horizon.
    pub fn push(&mut self, change: Change) {
        debug_assert!(
            self.records.back().map_or(true, |last| last.rv < change.rv),
            "history records must arrive in version order"
        );
        self.records.push_back(change);
        while self.records.len() > self.capacity {
            if let Some(dropped) = self.records.pop_front() {
                self.horizon = dropped.rv.next();
            }
        }
    }

    /// Discard records with versions at or below `through`, advancing the
    /// horizon. Never moves the horizon backwards.
    pub fn compact(&mut self, through: ResourceVersion) {
        while self
            .records
            .front()
            .is_some_and(|front| front.rv <= through)
        {
            self.records.pop_front();
        }
        if through.next() > self.horizon {
            self.horizon = through.next();
            debug!(horizon = %self.horizon, "history compacted");
        }
    }

    /// Can every mutation after `rv` still be served from this history?
    pub fn replayable_from(&self, rv: ResourceVersion) -> bool {
        rv.next() >= self.horizon
    }

    /// Records with versions strictly greater than `rv`, in version order.
    ///
    /// Callers must check [`replayable_from`](Self::replayable_from) first;
    /// this method only yields what is retained.
    pub fn replay_since(&self, rv: ResourceVersion) -> impl Iterator<Item = &Change> {
        self.records.iter().filter(move |change| change.rv > rv)
    }

    /// Reconstruct the live keyspace as it stood at version `rv`, starting
    /// from the current live view and reverse-applying newer records.
    ///
    /// Fails `Gone` when the required records were already compacted away.
    pub fn rewind(
        &self,
        live: &BTreeMap<Key, RawObject>,
        rv: ResourceVersion,
    ) -> StorageResult<BTreeMap<Key, RawObject>> {
        if !self.replayable_from(rv) {
            return Err(StorageError::Gone {
                requested: rv,
                horizon: self.horizon,
            });
        }
        let mut view = live.clone();
        for change in self.records.iter().rev() {
            if change.rv <= rv {
                break;
            }
            match &change.prev {
                Some(prev) => view.insert(change.key.clone(), prev.clone()),
                None => view.remove(&change.key),
            };
        }
        Ok(view)
    }
}
