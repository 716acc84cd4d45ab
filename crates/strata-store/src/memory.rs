//! In-memory store backend.
//!
//! [`MemoryStore`] commits through the [`NoopPersister`]: all state lives
//! on the heap behind the core's state lock. Intended for tests and
//! embedding; it provides the full contract including watches, history
//! replay, and strict continuation paging.

use crate::store::{NoopPersister, StoreConfig, StoreCore};

/// Heap-only store for tests and embedding.
pub type MemoryStore = StoreCore<NoopPersister>;

impl MemoryStore {
    /// An empty in-memory store with default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// An empty in-memory store with the given configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_persister(NoopPersister, config)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
