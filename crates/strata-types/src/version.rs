use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Global mutation stamp.
///
/// Every successful mutation — create, update, delete — consumes exactly one
/// `ResourceVersion` from a single store-wide sequence, so version order,
/// mutation order, and watch delivery order are the same total order.
/// `0` means "unset"; committed versions start at `1` and are never reused.
///
/// The decimal string codec (`Display`/`FromStr`) is the public surface for
/// stamping versions onto payload metadata and extracting them back.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The unset version.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw version number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw version number.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` for any committed (non-zero) version.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    /// The immediately following version.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rv{}", self.0)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceVersion {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| StorageError::Invalid(format!("malformed resource version: {s:?}")))
    }
}

impl From<u64> for ResourceVersion {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Version constraint on a read or list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RvMatch {
    /// No constraint: serve the newest committed state.
    #[default]
    Latest,
    /// Serve the state exactly as of the given version.
    Exact(ResourceVersion),
    /// Serve state no older than the given version.
    NotOlderThan(ResourceVersion),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_unset() {
        assert!(!ResourceVersion::ZERO.is_set());
        assert!(ResourceVersion::new(1).is_set());
    }

    #[test]
    fn string_codec_roundtrip() {
        let rv = ResourceVersion::new(42);
        assert_eq!(rv.to_string(), "42");
        assert_eq!("42".parse::<ResourceVersion>().unwrap(), rv);
    }

    #[test]
    fn malformed_strings_are_invalid() {
        for bad in ["", "-1", "abc", "1.5"] {
            assert!(matches!(
                bad.parse::<ResourceVersion>(),
                Err(StorageError::Invalid(_))
            ));
        }
    }

    #[test]
    fn ordering_follows_raw_value() {
        assert!(ResourceVersion::new(1) < ResourceVersion::new(2));
        assert_eq!(ResourceVersion::new(3).next(), ResourceVersion::new(4));
    }
}
