use thiserror::Error;

use crate::error::StorageError;
use crate::object::RawObject;
use crate::selector::Predicate;
use crate::version::ResourceVersion;

/// One unit of change notification on a watch stream.
///
/// Per subscription, events arrive in strictly increasing version order:
/// one event per matching mutation, plus synthetic [`Bookmark`] checkpoints
/// for subscribers that opted in and a single terminal [`Error`] when the
/// stream is torn down by the store.
///
/// [`Bookmark`]: WatchEvent::Bookmark
/// [`Error`]: WatchEvent::Error
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// An object became visible to this subscription.
    Added(RawObject),
    /// A visible object changed state.
    Modified(RawObject),
    /// An object left this subscription's view; carries the final state
    /// stamped with the deletion version.
    Deleted(RawObject),
    /// Synthetic checkpoint: no object change, only the newest version.
    Bookmark(ResourceVersion),
    /// Terminal event: the store closed this subscription.
    Error(CloseReason),
}

impl WatchEvent {
    /// The version this event was stamped with, if any.
    pub fn resource_version(&self) -> Option<ResourceVersion> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => Some(obj.rv),
            Self::Bookmark(rv) => Some(*rv),
            Self::Error(_) => None,
        }
    }

    /// The object snapshot carried by this event, if any.
    pub fn object(&self) -> Option<&RawObject> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => Some(obj),
            Self::Bookmark(_) | Self::Error(_) => None,
        }
    }

    /// Returns `true` for the terminal [`Error`](Self::Error) variant.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Why the store closed a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// The subscription's delivery buffer overflowed; the writer path is
    /// never blocked on a lagging consumer.
    #[error("subscription buffer overflowed")]
    Overflowed,

    /// The subscription exceeded its maximum lifetime.
    #[error("subscription exceeded its maximum lifetime")]
    TimedOut,
}

impl From<CloseReason> for StorageError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Overflowed => StorageError::Internal(reason.to_string()),
            CloseReason::TimedOut => StorageError::Timeout(reason.to_string()),
        }
    }
}

/// Where a new subscription starts on the version timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchStart {
    /// Deliver one `Added` per currently live matching object (sorted by
    /// key), then switch to live tail delivery.
    InitialSnapshot,
    /// Live tail only: no snapshot, no replay.
    LiveOnly,
    /// Replay every retained mutation with a version strictly greater than
    /// the given one, then switch to live tail delivery. Fails `Gone` when
    /// the version predates the retention horizon.
    AfterRevision(ResourceVersion),
}

/// Per-subscription watch parameters.
#[derive(Clone, Debug)]
pub struct WatchOptions {
    /// `true` scopes the watch to the whole subtree under the key;
    /// `false` addresses the single object at the key.
    pub recursive: bool,
    /// Starting point on the version timeline.
    pub start: WatchStart,
    /// Opaque filter evaluated against previous and new object states.
    pub predicate: Predicate,
    /// Opt in to periodic synthetic bookmark events.
    pub bookmarks: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            start: WatchStart::LiveOnly,
            predicate: Predicate::everything(),
            bookmarks: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    fn obj(rv: u64) -> RawObject {
        RawObject {
            key: Key::parse("ns1/a").unwrap(),
            data: vec![1],
            rv: ResourceVersion::new(rv),
        }
    }

    #[test]
    fn resource_version_per_variant() {
        assert_eq!(
            WatchEvent::Added(obj(5)).resource_version(),
            Some(ResourceVersion::new(5))
        );
        assert_eq!(
            WatchEvent::Bookmark(ResourceVersion::new(9)).resource_version(),
            Some(ResourceVersion::new(9))
        );
        assert_eq!(
            WatchEvent::Error(CloseReason::TimedOut).resource_version(),
            None
        );
    }

    #[test]
    fn only_error_is_terminal() {
        assert!(WatchEvent::Error(CloseReason::Overflowed).is_terminal());
        assert!(!WatchEvent::Deleted(obj(2)).is_terminal());
        assert!(!WatchEvent::Bookmark(ResourceVersion::ZERO).is_terminal());
    }

    #[test]
    fn close_reason_maps_into_taxonomy() {
        assert!(matches!(
            StorageError::from(CloseReason::TimedOut),
            StorageError::Timeout(_)
        ));
        assert!(matches!(
            StorageError::from(CloseReason::Overflowed),
            StorageError::Internal(_)
        ));
    }
}
