use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use crate::version::ResourceVersion;

/// A stored payload together with its key and version stamp.
///
/// The payload bytes are opaque to the store: encoding and decoding of
/// domain objects is the caller's concern. The `rv` field is `ZERO` on
/// objects the caller constructs and is stamped by the store on commit;
/// objects returned from reads always carry the version of the mutation
/// that produced them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObject {
    /// Location of the object in the keyspace.
    pub key: Key,
    /// Opaque serialized payload.
    pub data: Vec<u8>,
    /// Version of the mutation that produced this state.
    pub rv: ResourceVersion,
}

impl RawObject {
    /// Build an unstamped object for a create or update.
    pub fn new(key: Key, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            rv: ResourceVersion::ZERO,
        }
    }

    /// Copy of this object restamped with the given version.
    pub fn with_rv(&self, rv: ResourceVersion) -> Self {
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            rv,
        }
    }
}

impl std::fmt::Debug for RawObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawObject")
            .field("key", &self.key)
            .field("len", &self.data.len())
            .field("rv", &self.rv)
            .finish()
    }
}

/// Caller-supplied expected state for conditional mutations.
///
/// An unset field means "no constraint". Identity-shaped checks (payloads
/// are opaque bytes here) belong in the deletion-validation callback, not
/// in preconditions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Preconditions {
    /// Expected current resource version.
    pub rv: Option<ResourceVersion>,
}

impl Preconditions {
    /// No constraints.
    pub const fn none() -> Self {
        Self { rv: None }
    }

    /// Require the current object to carry exactly this version.
    pub const fn rv(rv: ResourceVersion) -> Self {
        Self { rv: Some(rv) }
    }

    /// Returns `true` if no constraint is set.
    pub fn is_empty(&self) -> bool {
        self.rv.is_none()
    }

    /// Check this precondition against the current object state.
    pub fn check(&self, current: &RawObject) -> StorageResult<()> {
        if let Some(expected) = self.rv {
            if current.rv != expected {
                return Err(StorageError::conflict(
                    current.key.as_str(),
                    format!("expected version {expected}, current is {}", current.rv),
                ));
            }
        }
        Ok(())
    }
}
