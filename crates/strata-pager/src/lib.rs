//! Multi-page list driver for Strata stores.
//!
//! [`ListPager`] walks a complete listing through repeated limit-bounded
//! [`Store::list`] calls, following continuation tokens. When a
//! continuation can no longer be honored (its snapshot was compacted away),
//! the pager either restarts with one full relist from scratch — the
//! reaction the storage contract expects of callers — or surfaces the
//! error, depending on configuration.

use tracing::debug;

use strata_store::{ListOptions, ListResult, Store};
use strata_types::{Key, Predicate, ResourceVersion, StorageError, StorageResult};

/// Drives a complete listing page by page.
#[derive(Clone, Debug)]
pub struct ListPager {
    /// Matching objects requested per page; `0` asks for everything in a
    /// single call.
    pub page_size: usize,
    /// On `InconsistentContinuation`, restart once with a full relist
    /// instead of surfacing the error.
    pub relist_on_expiry: bool,
}

impl ListPager {
    /// A pager fetching `page_size` objects per call, relisting once when
    /// a continuation expires.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            relist_on_expiry: true,
        }
    }

    /// Keep expired continuations as errors instead of relisting.
    pub fn strict(mut self) -> Self {
        self.relist_on_expiry = false;
        self
    }

    /// Collect every matching object under the prefix.
    ///
    /// The result carries the snapshot version of the **first** page; with
    /// retained history all pages are served from that same snapshot, and
    /// a mid-listing compaction either triggers the single relist or fails
    /// `InconsistentContinuation`.
    pub fn list_all(
        &self,
        store: &dyn Store,
        prefix: &Key,
        predicate: &Predicate,
    ) -> StorageResult<ListResult> {
        let mut relisted = false;
        let mut objects = Vec::new();
        let mut snapshot_rv = ResourceVersion::ZERO;
        let mut continue_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let options = ListOptions {
                limit: self.page_size,
                continue_token: continue_token.take(),
                predicate: predicate.clone(),
                ..ListOptions::default()
            };
            let page = match store.list(prefix, &options) {
                Ok(page) => page,
                Err(StorageError::InconsistentContinuation(reason))
                    if self.relist_on_expiry && !relisted =>
                {
                    debug!(%prefix, %reason, "continuation expired, relisting from scratch");
                    relisted = true;
                    objects.clear();
                    snapshot_rv = ResourceVersion::ZERO;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if objects.is_empty() {
                snapshot_rv = page.rv;
            }
            objects.extend(page.objects);
            pages += 1;

            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => {
                    debug!(%prefix, pages, objects = objects.len(), "listing complete");
                    return Ok(ListResult {
                        objects,
                        continue_token: None,
                        rv: snapshot_rv,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use strata_store::{DeleteValidator, MemoryStore, Subscription, Transform};
    use strata_types::{Preconditions, RawObject, RvMatch, WatchOptions};

    use super::*;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    fn filled_store(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..n {
            store
                .create(&key(&format!("ns1/obj-{i:03}")), vec![i as u8], None)
                .unwrap();
        }
        store
    }

    /// Store wrapper failing a configured number of `list` calls, as the
    /// conformance setup does to exercise the relist path.
    struct ListErrorInjectingStore {
        inner: MemoryStore,
        remaining_errors: AtomicUsize,
    }

    impl ListErrorInjectingStore {
        fn new(inner: MemoryStore, errors: usize) -> Self {
            Self {
                inner,
                remaining_errors: AtomicUsize::new(errors),
            }
        }
    }

    impl Store for ListErrorInjectingStore {
        fn create(
            &self,
            key: &Key,
            data: Vec<u8>,
            ttl: Option<Duration>,
        ) -> StorageResult<RawObject> {
            self.inner.create(key, data, ttl)
        }

        fn get(&self, key: &Key, rv_match: RvMatch) -> StorageResult<RawObject> {
            self.inner.get(key, rv_match)
        }

        fn delete(
            &self,
            key: &Key,
            preconditions: Preconditions,
            validate: Option<&DeleteValidator>,
            suggestion: Option<&RawObject>,
        ) -> StorageResult<RawObject> {
            self.inner.delete(key, preconditions, validate, suggestion)
        }

        fn guaranteed_update(
            &self,
            key: &Key,
            preconditions: Preconditions,
            ignore_not_found: bool,
            transform: &mut Transform<'_>,
            suggestion: Option<&RawObject>,
        ) -> StorageResult<RawObject> {
            self.inner
                .guaranteed_update(key, preconditions, ignore_not_found, transform, suggestion)
        }

        fn count(&self, prefix: &Key) -> StorageResult<u64> {
            self.inner.count(prefix)
        }

        fn list(&self, prefix: &Key, options: &ListOptions) -> StorageResult<ListResult> {
            // Only trip on continuation calls so the relist makes progress.
            if options.continue_token.is_some()
                && self
                    .remaining_errors
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StorageError::InconsistentContinuation(
                    "injected list error".into(),
                ));
            }
            self.inner.list(prefix, options)
        }

        fn watch(&self, key: &Key, options: &WatchOptions) -> StorageResult<Subscription> {
            self.inner.watch(key, options)
        }

        fn current_rv(&self) -> ResourceVersion {
            self.inner.current_rv()
        }

        fn compact(&self, through: ResourceVersion) -> StorageResult<()> {
            self.inner.compact(through)
        }

        fn request_watch_progress(&self) {
            self.inner.request_watch_progress()
        }

        fn sweep_expired(&self) -> StorageResult<u64> {
            self.inner.sweep_expired()
        }
    }

    #[test]
    fn collects_every_object_across_pages() {
        let store = filled_store(10);
        let pager = ListPager::new(3);
        let result = pager
            .list_all(&store, &key("ns1"), &Predicate::everything())
            .unwrap();

        assert_eq!(result.objects.len(), 10);
        let keys: Vec<&str> = result.objects.iter().map(|o| o.key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(result.rv, store.current_rv());
    }

    #[test]
    fn page_size_zero_lists_in_one_call() {
        let store = filled_store(4);
        let pager = ListPager::new(0);
        let result = pager
            .list_all(&store, &key("ns1"), &Predicate::everything())
            .unwrap();
        assert_eq!(result.objects.len(), 4);
    }

    #[test]
    fn predicate_narrows_the_result() {
        let store = filled_store(6);
        let pager = ListPager::new(2);
        let even = Predicate::from_fn(|o| o.data[0] % 2 == 0);
        let result = pager.list_all(&store, &key("ns1"), &even).unwrap();
        assert_eq!(result.objects.len(), 3);
    }

    #[test]
    fn expired_continuation_triggers_one_full_relist() {
        let store = ListErrorInjectingStore::new(filled_store(9), 1);
        let pager = ListPager::new(4);
        let result = pager
            .list_all(&store, &key("ns1"), &Predicate::everything())
            .unwrap();
        // The relist starts over: every object exactly once.
        assert_eq!(result.objects.len(), 9);
    }

    #[test]
    fn strict_pager_surfaces_the_error() {
        let store = ListErrorInjectingStore::new(filled_store(9), 1);
        let pager = ListPager::new(4).strict();
        let err = pager
            .list_all(&store, &key("ns1"), &Predicate::everything())
            .unwrap_err();
        assert!(matches!(err, StorageError::InconsistentContinuation(_)));
    }

    #[test]
    fn repeated_expiry_is_not_retried_forever() {
        let store = ListErrorInjectingStore::new(filled_store(9), usize::MAX);
        let pager = ListPager::new(4);
        let err = pager
            .list_all(&store, &key("ns1"), &Predicate::everything())
            .unwrap_err();
        assert!(matches!(err, StorageError::InconsistentContinuation(_)));
    }
}
