//! Versioned object store for Strata.
//!
//! Every mutation — create, update, delete — is serialized through one
//! commit boundary, stamped with the next [`ResourceVersion`] from a single
//! store-wide counter, appended to a bounded change history, and routed to
//! watch subscribers before the commit lock is released. Version order,
//! mutation order, and watch delivery order are therefore the same total
//! order, and no reader can observe state newer than what watchers were
//! notified of.
//!
//! # Backends
//!
//! All backends implement the [`Store`] trait:
//!
//! - [`MemoryStore`] — heap-only store for tests and embedding
//! - [`FsStore`] — file-per-key store with checksummed envelopes
//!
//! # Design Rules
//!
//! 1. One resource version per successful mutation; versions are never
//!    reused and deletions consume one too.
//! 2. Commit and watch enqueue happen inside the same critical section.
//! 3. A failed write leaves prior state entirely intact.
//! 4. History is bounded: the [`Compactor`] (or the capacity cap) advances
//!    the retention horizon, and anything older fails `Gone` or
//!    `InconsistentContinuation` explicitly — never silently.
//!
//! [`ResourceVersion`]: strata_types::ResourceVersion

pub mod compact;
pub mod fs;
pub mod history;
pub mod memory;
pub mod store;
pub mod token;
pub mod traits;
pub mod version;

pub use compact::{CompactionPolicy, Compactor};
pub use fs::{FsPersister, FsStore};
pub use memory::MemoryStore;
pub use store::{NoopPersister, Persister, StoreConfig, StoreCore};
pub use traits::{DeleteValidator, ListOptions, ListResult, Store, Transform, Transformed};
pub use version::VersionCounter;

// Re-exported so embedders of a store need not depend on the watch crate
// directly.
pub use strata_watch::{Broadcaster, Subscription, WatchConfig};
