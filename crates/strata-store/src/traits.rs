use std::time::Duration;

use strata_types::{
    Key, Preconditions, Predicate, RawObject, ResourceVersion, RvMatch, StorageResult,
    WatchOptions,
};
use strata_watch::Subscription;

/// Caller-supplied deletion gate, re-invoked against the fresh state on
/// every retry. Identity-shaped checks (payloads are opaque to the store)
/// belong here.
pub type DeleteValidator = dyn Fn(&RawObject) -> StorageResult<()> + Send + Sync;

/// Caller-supplied state transition for [`Store::guaranteed_update`].
///
/// Receives the current object (`None` when absent and `ignore_not_found`
/// was set) and produces the next payload. Any error aborts the update
/// immediately — the retry loop only re-runs the transform after a version
/// race, never after a transform failure.
pub type Transform<'a> = dyn FnMut(Option<&RawObject>) -> StorageResult<Transformed> + 'a;

/// Output of a [`Transform`]: the next payload and its expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transformed {
    /// The next payload to store.
    pub data: Vec<u8>,
    /// Time-to-live for the new state; `None` stores it without expiry.
    pub ttl: Option<Duration>,
}

impl Transformed {
    /// A transition to the given payload with no expiry.
    pub fn to(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ttl: None,
        }
    }

    /// Attach a time-to-live to this transition.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Parameters of a [`Store::list`] call.
#[derive(Clone, Debug)]
pub struct ListOptions {
    /// `true` lists the whole subtree under the prefix; `false` addresses
    /// the single object at the key.
    pub recursive: bool,
    /// Version constraint for the snapshot the list is served from.
    pub rv_match: RvMatch,
    /// Maximum matching objects per page; `0` means unlimited. Ignored by
    /// stores configured without paging.
    pub limit: usize,
    /// Opaque continuation from a previous truncated page. Cannot be
    /// combined with a version constraint.
    pub continue_token: Option<String>,
    /// Opaque filter; only matching objects are returned and counted
    /// against `limit`.
    pub predicate: Predicate,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            rv_match: RvMatch::Latest,
            limit: 0,
            continue_token: None,
            predicate: Predicate::everything(),
        }
    }
}

/// One page of list results.
#[derive(Clone, Debug)]
pub struct ListResult {
    /// Matching objects in sorted key order, each carrying its own version.
    pub objects: Vec<RawObject>,
    /// Present when the page was truncated; resumes strictly after the
    /// last returned key against the same snapshot.
    pub continue_token: Option<String>,
    /// The snapshot version: every returned object existed, unmodified, as
    /// of this version.
    pub rv: ResourceVersion,
}

/// The storage contract: durable keyed objects, one global version
/// sequence, conditional mutations, and ordered watch streams.
///
/// All implementations must satisfy these invariants:
/// - Every successful mutation consumes exactly one resource version from
///   a single store-wide sequence; versions are never reused.
/// - A mutation's commit and the enqueueing of its watch event happen as
///   one step: readers never observe state watchers were not notified of.
/// - Conditional operations are atomic; a failed write leaves the prior
///   state entirely intact.
/// - The store never interprets payload bytes.
pub trait Store: Send + Sync {
    /// Store a new object. Fails `AlreadyExists` when the key holds a live
    /// object. With a `ttl`, the object expires and is purged as a regular
    /// deletion once the deadline passes.
    fn create(
        &self,
        key: &Key,
        data: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<RawObject>;

    /// Read the object at the key, optionally pinned to a version
    /// constraint. Fails `NotFound` when absent (at the requested version),
    /// `Gone` for exact versions below the retention horizon, and `Timeout`
    /// for freshness requirements beyond the newest committed version.
    fn get(&self, key: &Key, rv_match: RvMatch) -> StorageResult<RawObject>;

    /// Delete the object at the key, returning its final state stamped with
    /// the deletion version.
    ///
    /// Without preconditions the delete is unconditional. `suggestion` lets
    /// the caller supply a believed-current object to skip a fresh read; a
    /// stale suggestion is re-read and retried transparently, while a
    /// genuine precondition mismatch against the true current state fails
    /// `Conflict`. `validate` runs against the state actually being
    /// deleted, on every retry.
    fn delete(
        &self,
        key: &Key,
        preconditions: Preconditions,
        validate: Option<&DeleteValidator>,
        suggestion: Option<&RawObject>,
    ) -> StorageResult<RawObject>;

    /// Atomically transition the object at the key through `transform`.
    ///
    /// A bounded optimistic-concurrency loop: observe the current state
    /// (the `suggestion` on the first attempt, a fresh read otherwise),
    /// check `preconditions`, run `transform`, and commit only if the key's
    /// version is unchanged since the observation — otherwise re-read and
    /// retry. Exhausting the attempt bound or a precondition mismatch fails
    /// `Conflict`; transform errors abort immediately. With
    /// `ignore_not_found`, an absent key feeds `None` to the transform
    /// instead of failing `NotFound`. A transform returning identical bytes
    /// with unchanged expiry commits nothing and consumes no version.
    fn guaranteed_update(
        &self,
        key: &Key,
        preconditions: Preconditions,
        ignore_not_found: bool,
        transform: &mut Transform<'_>,
        suggestion: Option<&RawObject>,
    ) -> StorageResult<RawObject>;

    /// Number of live objects under the prefix. Best-effort instantaneous
    /// count, not version-stamped.
    fn count(&self, prefix: &Key) -> StorageResult<u64>;

    /// List objects under the prefix in sorted key order. See
    /// [`ListOptions`] for paging, version pinning, and filtering; a
    /// continuation whose snapshot history was compacted fails
    /// `InconsistentContinuation`.
    fn list(&self, prefix: &Key, options: &ListOptions) -> StorageResult<ListResult>;

    /// Open a watch stream scoped to the key. Fails `Gone` immediately when
    /// the requested start predates the retention horizon.
    fn watch(&self, key: &Key, options: &WatchOptions) -> StorageResult<Subscription>;

    /// The newest committed version.
    fn current_rv(&self) -> ResourceVersion;

    /// Discard mutation history at or below `through`. Live objects are
    /// unaffected; only watch replay and exact-version reads older than the
    /// new horizon are lost.
    fn compact(&self, through: ResourceVersion) -> StorageResult<()>;

    /// Send an on-demand bookmark carrying the newest committed version to
    /// every bookmark-opted watch subscription.
    fn request_watch_progress(&self);

    /// Purge every expired object as a regular deletion (consuming
    /// versions and notifying watchers). Returns the number purged.
    fn sweep_expired(&self) -> StorageResult<u64>;
}
