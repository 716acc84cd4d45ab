use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Hierarchical location of an object in the keyspace.
///
/// A `Key` is a `/`-separated path such as `registry/pods/ns1/a`. Keys are
/// validated on construction: non-empty, no leading/trailing or doubled
/// separators, and no `.`/`..` segments (keys map directly onto filesystem
/// paths in the file-backed store).
///
/// Ordering is lexicographic over the full path, which is also the
/// iteration order of lists and initial watch snapshots.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Parse and validate a key.
    pub fn parse(raw: impl Into<String>) -> Result<Self, StorageError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(StorageError::Invalid("key must not be empty".into()));
        }
        if raw.starts_with('/') || raw.ends_with('/') {
            return Err(StorageError::Invalid(format!(
                "key must not start or end with '/': {raw}"
            )));
        }
        for segment in raw.split('/') {
            if segment.is_empty() {
                return Err(StorageError::Invalid(format!(
                    "key contains an empty segment: {raw}"
                )));
            }
            if segment == "." || segment == ".." {
                return Err(StorageError::Invalid(format!(
                    "key contains a relative segment: {raw}"
                )));
            }
            if segment.contains('\0') {
                return Err(StorageError::Invalid("key contains a NUL byte".into()));
            }
        }
        Ok(Self(raw))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterator over the `/`-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The final segment (the object's own name).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Append a child segment, producing a deeper key.
    pub fn child(&self, segment: &str) -> Result<Self, StorageError> {
        Self::parse(format!("{}/{segment}", self.0))
    }

    /// Returns `true` if `self` is a segment-boundary prefix of `other`
    /// (or equal to it). `ns1` covers `ns1/a` but not `ns10/a`.
    pub fn contains(&self, other: &Key) -> bool {
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes()[self.0.len()] == b'/')
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Key {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Key {
    type Error = StorageError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
