use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use strata_types::{
    Key, Preconditions, RawObject, ResourceVersion, RvMatch, StorageError, StorageResult,
    WatchEvent, WatchOptions, WatchStart,
};
use strata_watch::{Broadcaster, Change, Subscription, WatchConfig};

use crate::history::History;
use crate::token;
use crate::traits::{DeleteValidator, ListOptions, ListResult, Store, Transform};
use crate::version::VersionCounter;

/// Durability hook invoked inside the commit critical section.
///
/// Implementations persist the post-mutation state of a single key before
/// the mutation becomes visible; a failure aborts the commit with prior
/// state intact. The in-memory backend uses [`NoopPersister`], the
/// filesystem backend persists one file per key.
pub trait Persister: Send + Sync {
    /// Persist the new state of `object` (stamped with its version).
    fn persist(&self, object: &RawObject, expires_at: Option<SystemTime>) -> StorageResult<()>;

    /// Remove the durable state of a deleted key.
    fn remove(&self, key: &Key) -> StorageResult<()>;
}

/// Persister that keeps everything on the heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPersister;

impl Persister for NoopPersister {
    fn persist(&self, _object: &RawObject, _expires_at: Option<SystemTime>) -> StorageResult<()> {
        Ok(())
    }

    fn remove(&self, _key: &Key) -> StorageResult<()> {
        Ok(())
    }
}

/// Configuration for a [`StoreCore`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// When `false`, list limits are ignored and continuation tokens are
    /// never produced (legacy unpaged mode).
    pub paging: bool,
    /// Maximum retained change records; exceeding the cap advances the
    /// retention horizon like an explicit compaction.
    pub history_capacity: usize,
    /// Attempt bound for the optimistic retry loops in
    /// `guaranteed_update` and conditional `delete`.
    pub update_max_attempts: usize,
    /// Watch delivery configuration.
    pub watch: WatchConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            paging: true,
            history_capacity: 4096,
            update_max_attempts: 5,
            watch: WatchConfig::default(),
        }
    }
}

/// A live object plus its expiry deadline.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub(crate) object: RawObject,
    pub(crate) expires_at: Option<SystemTime>,
}

impl Entry {
    pub(crate) fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

struct State {
    live: BTreeMap<Key, Entry>,
    counter: VersionCounter,
    history: History,
}

/// The storage engine shared by every backend.
///
/// All mutations pass through one commit boundary — the state write lock —
/// where they are stamped by the [`VersionCounter`], persisted through the
/// backend's [`Persister`], appended to the [`History`], and routed to the
/// [`Broadcaster`], in that order. Reads take the shared lock and never
/// mutate; expired entries are filtered on read and purged as real
/// deletions on the mutation path or via [`sweep_expired`].
///
/// [`sweep_expired`]: Store::sweep_expired
pub struct StoreCore<P: Persister> {
    state: RwLock<State>,
    broadcaster: Arc<Broadcaster>,
    persister: P,
    config: StoreConfig,
}

impl<P: Persister> StoreCore<P> {
    /// A fresh, empty store committing through the given persister.
    pub fn with_persister(persister: P, config: StoreConfig) -> Self {
        Self::from_recovered(persister, config, BTreeMap::new(), ResourceVersion::ZERO)
    }

    /// A store resuming from recovered live state. The version sequence
    /// continues after `recovered`, and — since mutation history was not
    /// recovered — the retention horizon starts just above it.
    pub(crate) fn from_recovered(
        persister: P,
        config: StoreConfig,
        live: BTreeMap<Key, Entry>,
        recovered: ResourceVersion,
    ) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(config.watch.clone()));
        Self {
            state: RwLock::new(State {
                live,
                counter: VersionCounter::starting_after(recovered),
                history: History::with_horizon(config.history_capacity, recovered.next()),
            }),
            broadcaster,
            persister,
            config,
        }
    }

    /// This store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The watch broadcaster, for spawning its maintenance task.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Oldest version still served by watch replay and exact-version reads.
    pub fn horizon(&self) -> ResourceVersion {
        self.read_state().history.horizon()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().expect("state lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().expect("state lock poisoned")
    }

    /// Commit a create/update of `key` under the state lock.
    fn commit_put_locked(
        &self,
        state: &mut State,
        key: &Key,
        data: Vec<u8>,
        expires_at: Option<SystemTime>,
    ) -> StorageResult<RawObject> {
        let rv = state.counter.preview();
        let object = RawObject {
            key: key.clone(),
            data,
            rv,
        };
        self.persister.persist(&object, expires_at)?;
        state.counter.commit(rv);
        let prev = state.live.insert(
            key.clone(),
            Entry {
                object: object.clone(),
                expires_at,
            },
        );
        let change = Change {
            rv,
            key: key.clone(),
            prev: prev.map(|entry| entry.object),
            current: Some(object.clone()),
        };
        state.history.push(change.clone());
        self.broadcaster.route(&change);
        trace!(%key, rv = rv.get(), "committed put");
        Ok(object)
    }

    /// Commit the deletion of `key` under the state lock; `prev` must be
    /// the entry's current object. Returns the final state stamped with
    /// the deletion version.
    fn commit_delete_locked(
        &self,
        state: &mut State,
        key: &Key,
        prev: RawObject,
    ) -> StorageResult<RawObject> {
        let rv = state.counter.preview();
        self.persister.remove(key)?;
        state.counter.commit(rv);
        state.live.remove(key);
        let final_state = prev.with_rv(rv);
        let change = Change {
            rv,
            key: key.clone(),
            prev: Some(prev),
            current: None,
        };
        state.history.push(change.clone());
        self.broadcaster.route(&change);
        trace!(%key, rv = rv.get(), "committed delete");
        Ok(final_state)
    }

    /// Purge `key` if its entry has expired: a real deletion consuming a
    /// version and notifying watchers.
    fn purge_expired_locked(
        &self,
        state: &mut State,
        key: &Key,
        now: SystemTime,
    ) -> StorageResult<()> {
        let expired = match state.live.get(key) {
            Some(entry) if entry.is_expired(now) => Some(entry.object.clone()),
            _ => None,
        };
        if let Some(prev) = expired {
            debug!(%key, "purging expired object");
            self.commit_delete_locked(state, key, prev)?;
        }
        Ok(())
    }

    fn live_get(&self, state: &State, key: &Key, now: SystemTime) -> StorageResult<RawObject> {
        match state.live.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(entry.object.clone()),
            _ => Err(StorageError::not_found(key.as_str())),
        }
    }

    /// Every entry as a plain object map, including expired-but-unswept
    /// entries (they were live at any reconstructed version, since no
    /// deletion record exists for them yet).
    fn all_objects(state: &State) -> BTreeMap<Key, RawObject> {
        state
            .live
            .iter()
            .map(|(key, entry)| (key.clone(), entry.object.clone()))
            .collect()
    }

    fn live_objects(state: &State, now: SystemTime) -> BTreeMap<Key, RawObject> {
        state
            .live
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.object.clone()))
            .collect()
    }

    fn covers(scope: &Key, recursive: bool, key: &Key) -> bool {
        if recursive {
            scope.contains(key)
        } else {
            scope == key
        }
    }

    fn future_version_timeout(requested: ResourceVersion, current: ResourceVersion) -> StorageError {
        StorageError::Timeout(format!(
            "requested version {requested} is newer than the newest committed version {current}"
        ))
    }
}

impl<P: Persister> Store for StoreCore<P> {
    fn create(
        &self,
        key: &Key,
        data: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<RawObject> {
        let now = SystemTime::now();
        let mut state = self.write_state();
        self.purge_expired_locked(&mut state, key, now)?;
        if state.live.contains_key(key) {
            return Err(StorageError::already_exists(key.as_str()));
        }
        let expires_at = ttl.map(|d| now + d);
        let object = self.commit_put_locked(&mut state, key, data, expires_at)?;
        debug!(%key, rv = object.rv.get(), "created");
        Ok(object)
    }

    fn get(&self, key: &Key, rv_match: RvMatch) -> StorageResult<RawObject> {
        let now = SystemTime::now();
        let state = self.read_state();
        let current = state.counter.current();
        match rv_match {
            RvMatch::Latest => self.live_get(&state, key, now),
            RvMatch::NotOlderThan(required) => {
                if required > current {
                    return Err(Self::future_version_timeout(required, current));
                }
                self.live_get(&state, key, now)
            }
            RvMatch::Exact(rv) => {
                if rv > current {
                    return Err(Self::future_version_timeout(rv, current));
                }
                let view = state.history.rewind(&Self::all_objects(&state), rv)?;
                view.get(key)
                    .cloned()
                    .ok_or_else(|| StorageError::not_found(key.as_str()))
            }
        }
    }

    fn delete(
        &self,
        key: &Key,
        preconditions: Preconditions,
        validate: Option<&DeleteValidator>,
        suggestion: Option<&RawObject>,
    ) -> StorageResult<RawObject> {
        let now = SystemTime::now();
        let mut state = self.write_state();
        self.purge_expired_locked(&mut state, key, now)?;

        let current = match state.live.get(key) {
            Some(entry) => entry.object.clone(),
            None => return Err(StorageError::not_found(key.as_str())),
        };

        // First pass may evaluate the caller's believed-current object; a
        // stale suggestion is re-checked against the fresh state instead of
        // surfacing its outcome (the transparent retry of the contract).
        let mut subject = suggestion.cloned().unwrap_or_else(|| current.clone());
        for _attempt in 0..self.config.update_max_attempts.max(1) {
            let fresh = subject.rv == current.rv;
            let checked = preconditions.check(&subject).and_then(|()| match validate {
                Some(validate) => validate(&subject),
                None => Ok(()),
            });
            match checked {
                Ok(()) if fresh => return self.commit_delete_locked(&mut state, key, current),
                Err(err) if fresh => return Err(err),
                _ => {
                    trace!(%key, "stale deletion suggestion, re-checking fresh state");
                    subject = current.clone();
                }
            }
        }
        Err(StorageError::conflict(
            key.as_str(),
            format!(
                "delete exceeded {} attempts",
                self.config.update_max_attempts
            ),
        ))
    }

    fn guaranteed_update(
        &self,
        key: &Key,
        preconditions: Preconditions,
        ignore_not_found: bool,
        transform: &mut Transform<'_>,
        suggestion: Option<&RawObject>,
    ) -> StorageResult<RawObject> {
        let mut use_suggestion = suggestion.is_some();
        for _attempt in 0..self.config.update_max_attempts.max(1) {
            let now = SystemTime::now();
            let from_suggestion = use_suggestion;
            use_suggestion = false;

            // Observe outside the commit lock: the transform may be slow
            // and must never extend the commit critical section.
            let observed: Option<RawObject> = if from_suggestion {
                suggestion.cloned()
            } else {
                let state = self.read_state();
                match state.live.get(key) {
                    Some(entry) if !entry.is_expired(now) => Some(entry.object.clone()),
                    _ => None,
                }
            };

            let current = match observed {
                Some(object) => Some(object),
                None if ignore_not_found => None,
                None => return Err(StorageError::not_found(key.as_str())),
            };

            if let Some(ref object) = current {
                if let Err(err) = preconditions.check(object) {
                    if from_suggestion {
                        continue; // Stale suggestion: re-check a fresh read.
                    }
                    return Err(err);
                }
            } else if !preconditions.is_empty() {
                return Err(StorageError::conflict(
                    key.as_str(),
                    "no live object to evaluate preconditions against",
                ));
            }

            let transformed = match transform(current.as_ref()) {
                Ok(transformed) => transformed,
                Err(err) => {
                    if from_suggestion {
                        continue; // The suggestion may have misled the transform.
                    }
                    return Err(err);
                }
            };

            // Commit phase: revalidate the version under the write lock.
            let mut state = self.write_state();
            self.purge_expired_locked(&mut state, key, now)?;
            let rv_now = state.live.get(key).map(|entry| entry.object.rv);
            let rv_observed = current.as_ref().map(|object| object.rv);
            if rv_now != rv_observed {
                debug!(%key, "version race in guaranteed update, retrying");
                continue;
            }

            // Identical bytes with unchanged expiry: nothing to commit.
            if let Some(entry) = state.live.get(key) {
                if transformed.data == entry.object.data
                    && transformed.ttl.is_none()
                    && entry.expires_at.is_none()
                {
                    return Ok(entry.object.clone());
                }
            }

            let expires_at = transformed.ttl.map(|d| now + d);
            let object = self.commit_put_locked(&mut state, key, transformed.data, expires_at)?;
            debug!(%key, rv = object.rv.get(), "guaranteed update committed");
            return Ok(object);
        }
        Err(StorageError::conflict(
            key.as_str(),
            format!(
                "update exceeded {} attempts",
                self.config.update_max_attempts
            ),
        ))
    }

    fn count(&self, prefix: &Key) -> StorageResult<u64> {
        let now = SystemTime::now();
        let state = self.read_state();
        let count = state
            .live
            .iter()
            .filter(|(key, entry)| prefix.contains(key) && !entry.is_expired(now))
            .count();
        Ok(count as u64)
    }

    fn list(&self, prefix: &Key, options: &ListOptions) -> StorageResult<ListResult> {
        let now = SystemTime::now();
        let state = self.read_state();
        let current = state.counter.current();

        let (view, snapshot_rv, start_after) = if let Some(tok) = &options.continue_token {
            if options.rv_match != RvMatch::Latest {
                return Err(StorageError::Invalid(
                    "continuation cannot be combined with a version constraint".into(),
                ));
            }
            let (last_key, token_rv) = token::decode(tok)?;
            if token_rv > current {
                return Err(StorageError::Invalid(format!(
                    "continuation snapshot {token_rv} is newer than the newest committed version {current}"
                )));
            }
            let view = state
                .history
                .rewind(&Self::all_objects(&state), token_rv)
                .map_err(|err| match err {
                    StorageError::Gone { requested, horizon } => {
                        StorageError::InconsistentContinuation(format!(
                            "snapshot {requested} predates the retention horizon {horizon}; relist from scratch"
                        ))
                    }
                    other => other,
                })?;
            (view, token_rv, Some(last_key))
        } else {
            match options.rv_match {
                RvMatch::Latest => (Self::live_objects(&state, now), current, None),
                RvMatch::NotOlderThan(required) => {
                    if required > current {
                        return Err(Self::future_version_timeout(required, current));
                    }
                    (Self::live_objects(&state, now), current, None)
                }
                RvMatch::Exact(rv) => {
                    if rv > current {
                        return Err(Self::future_version_timeout(rv, current));
                    }
                    let view = state.history.rewind(&Self::all_objects(&state), rv)?;
                    (view, rv, None)
                }
            }
        };

        if !options.recursive {
            let objects = view
                .get(prefix)
                .filter(|object| options.predicate.matches(object))
                .cloned()
                .into_iter()
                .collect();
            return Ok(ListResult {
                objects,
                continue_token: None,
                rv: snapshot_rv,
            });
        }

        let paged = self.config.paging && options.limit > 0;
        let lower = match &start_after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Included(prefix.clone()),
        };

        let mut objects: Vec<RawObject> = Vec::new();
        let mut continue_token = None;
        for (key, object) in view.range((lower, Bound::Unbounded)) {
            if !prefix.contains(key) {
                break;
            }
            if !options.predicate.matches(object) {
                continue;
            }
            if paged && objects.len() == options.limit {
                // One more match exists beyond the page: truncate here.
                if let Some(last) = objects.last() {
                    continue_token = Some(token::encode(&last.key, snapshot_rv));
                }
                break;
            }
            objects.push(object.clone());
        }

        Ok(ListResult {
            objects,
            continue_token,
            rv: snapshot_rv,
        })
    }

    fn watch(&self, key: &Key, options: &WatchOptions) -> StorageResult<Subscription> {
        let now = SystemTime::now();
        // The shared lock excludes writers: no mutation can land between
        // building the backlog and registering the subscription.
        let state = self.read_state();
        let current = state.counter.current();

        let backlog: Vec<WatchEvent> = match options.start {
            WatchStart::LiveOnly => Vec::new(),
            WatchStart::InitialSnapshot => state
                .live
                .iter()
                .filter(|(k, entry)| {
                    Self::covers(key, options.recursive, k) && !entry.is_expired(now)
                })
                .filter(|(_, entry)| options.predicate.matches(&entry.object))
                .map(|(_, entry)| WatchEvent::Added(entry.object.clone()))
                .collect(),
            WatchStart::AfterRevision(rv) => {
                if rv > current {
                    return Err(StorageError::Invalid(format!(
                        "cannot watch from future version {rv} (newest is {current})"
                    )));
                }
                if !state.history.replayable_from(rv) {
                    return Err(StorageError::Gone {
                        requested: rv,
                        horizon: state.history.horizon(),
                    });
                }
                state
                    .history
                    .replay_since(rv)
                    .filter(|change| Self::covers(key, options.recursive, &change.key))
                    .filter_map(|change| change.event_for(&options.predicate))
                    .collect()
            }
        };

        debug!(%key, start = ?options.start, backlog = backlog.len(), "watch opened");
        Ok(self.broadcaster.subscribe(key.clone(), options, backlog, current))
    }

    fn current_rv(&self) -> ResourceVersion {
        self.read_state().counter.current()
    }

    fn compact(&self, through: ResourceVersion) -> StorageResult<()> {
        let mut state = self.write_state();
        let through = through.min(state.counter.current());
        state.history.compact(through);
        Ok(())
    }

    fn request_watch_progress(&self) {
        self.broadcaster.request_progress();
    }

    fn sweep_expired(&self) -> StorageResult<u64> {
        let now = SystemTime::now();
        let mut state = self.write_state();
        let expired: Vec<Key> = state
            .live
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.purge_expired_locked(&mut state, key, now)?;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired objects");
        }
        Ok(expired.len() as u64)
    }
}

impl<P: Persister> std::fmt::Debug for StoreCore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("StoreCore")
            .field("live", &state.live.len())
            .field("current_rv", &state.counter.current())
            .field("horizon", &state.history.horizon())
            .finish()
    }
}
