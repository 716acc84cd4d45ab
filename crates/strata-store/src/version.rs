use strata_types::ResourceVersion;

/// The store-wide mutation sequence.
///
/// Lives inside the store's state lock — the same serialization boundary
/// that persists mutations and enqueues their watch events — so a version
/// is only ever consumed by a committed mutation and callers can never
/// advance the sequence directly.
///
/// The two-phase API separates stamping from consumption: `preview` yields
/// the version a mutation will carry (needed before persistence, since the
/// stamp is part of the durable envelope), and `commit` consumes it only
/// once persistence succeeded. A failed write therefore leaves the
/// sequence, like all other state, untouched.
#[derive(Debug, Default)]
pub struct VersionCounter {
    last: u64,
}

impl VersionCounter {
    /// A counter with no committed versions; the first mutation gets `1`.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// A counter resuming after the given version (backend recovery).
    pub fn starting_after(last: ResourceVersion) -> Self {
        Self { last: last.get() }
    }

    /// The newest committed version; `ZERO` when nothing was committed.
    pub fn current(&self) -> ResourceVersion {
        ResourceVersion::new(self.last)
    }

    /// The version the next successful mutation will consume.
    pub fn preview(&self) -> ResourceVersion {
        ResourceVersion::new(self.last + 1)
    }

    /// Consume a previewed version after its mutation persisted.
    pub fn commit(&mut self, rv: ResourceVersion) {
        debug_assert_eq!(rv.get(), self.last + 1, "versions must be consumed in order");
        self.last = rv.get();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset_and_increments() {
        let mut counter = VersionCounter::new();
        assert_eq!(counter.current(), ResourceVersion::ZERO);

        let rv = counter.preview();
        assert_eq!(rv, ResourceVersion::new(1));
        counter.commit(rv);
        assert_eq!(counter.current(), rv);
        assert_eq!(counter.preview(), ResourceVersion::new(2));
    }

    #[test]
    fn preview_without_commit_consumes_nothing() {
        let counter = VersionCounter::new();
        let _ = counter.preview();
        let _ = counter.preview();
        assert_eq!(counter.current(), ResourceVersion::ZERO);
    }

    #[test]
    fn resumes_after_recovered_version() {
        let counter = VersionCounter::starting_after(ResourceVersion::new(41));
        assert_eq!(counter.preview(), ResourceVersion::new(42));
    }
}
