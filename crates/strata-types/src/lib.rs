//! Foundation types for Strata.
//!
//! This crate provides the core identity, versioning, and event types used
//! throughout the Strata system. Every other Strata crate depends on
//! `strata-types`.
//!
//! # Key Types
//!
//! - [`Key`] — Validated hierarchical location of an object in the keyspace
//! - [`ResourceVersion`] — Global monotonic stamp assigned to every mutation
//! - [`RawObject`] — A stored payload together with its key and version stamp
//! - [`Predicate`] — Opaque selection capability for filtering lists/watches
//! - [`WatchEvent`] — One unit of change notification on a watch stream
//! - [`StorageError`] — The unified error taxonomy of the storage contract

pub mod error;
pub mod event;
pub mod key;
pub mod object;
pub mod selector;
pub mod version;

pub use error::{StorageError, StorageResult};
pub use event::{CloseReason, WatchEvent, WatchOptions, WatchStart};
pub use key::Key;
pub use object::{Preconditions, RawObject};
pub use selector::{AttrsFn, Fields, KeyFn, Labels, Predicate};
pub use version::{ResourceVersion, RvMatch};
