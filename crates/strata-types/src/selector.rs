//! Opaque selection and key-derivation capabilities.
//!
//! The store never inspects payload structure. Callers that want label or
//! field selection inject a pure attribute extractor and a match function;
//! the store only ever evaluates the resulting [`Predicate`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::StorageResult;
use crate::key::Key;
use crate::object::RawObject;

/// Label set extracted from an object.
pub type Labels = BTreeMap<String, String>;

/// Field set extracted from an object.
pub type Fields = BTreeMap<String, String>;

/// Injected pure function mapping an object to its label and field sets.
pub type AttrsFn = Arc<dyn Fn(&RawObject) -> StorageResult<(Labels, Fields)> + Send + Sync>;

/// Injected function deriving a storage key from an object's identity.
pub type KeyFn = Arc<dyn Fn(&RawObject) -> StorageResult<Key> + Send + Sync>;

/// Opaque object filter applied to list results and watch deliveries.
///
/// Cheap to clone; evaluation must be pure — the store may call it any
/// number of times for the same object, including against historical states.
#[derive(Clone)]
pub struct Predicate {
    matcher: Arc<dyn Fn(&RawObject) -> bool + Send + Sync>,
    universal: bool,
}

impl Predicate {
    /// A predicate matching every object.
    pub fn everything() -> Self {
        Self {
            matcher: Arc::new(|_| true),
            universal: true,
        }
    }

    /// Wrap an arbitrary match function.
    pub fn from_fn(f: impl Fn(&RawObject) -> bool + Send + Sync + 'static) -> Self {
        Self {
            matcher: Arc::new(f),
            universal: false,
        }
    }

    /// Build a predicate from an attribute extractor and a selector over the
    /// extracted label/field sets. Objects the extractor rejects never match.
    pub fn from_attrs(
        attrs: AttrsFn,
        selector: impl Fn(&Labels, &Fields) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            matcher: Arc::new(move |obj| match attrs(obj) {
                Ok((labels, fields)) => selector(&labels, &fields),
                Err(_) => false,
            }),
            universal: false,
        }
    }

    /// Evaluate the predicate.
    pub fn matches(&self, obj: &RawObject) -> bool {
        (self.matcher)(obj)
    }

    /// Returns `true` if this predicate is known to match everything,
    /// letting callers skip per-object evaluation.
    pub fn is_universal(&self) -> bool {
        self.universal
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::everything()
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("universal", &self.universal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn obj(data: &[u8]) -> RawObject {
        RawObject::new(Key::parse("ns1/a").unwrap(), data.to_vec())
    }

    #[test]
    fn everything_matches_all() {
        let pred = Predicate::everything();
        assert!(pred.is_universal());
        assert!(pred.matches(&obj(b"anything")));
    }

    #[test]
    fn from_fn_filters() {
        let pred = Predicate::from_fn(|o| o.data.starts_with(b"keep"));
        assert!(pred.matches(&obj(b"keep me")));
        assert!(!pred.matches(&obj(b"drop me")));
        assert!(!pred.is_universal());
    }

    #[test]
    fn from_attrs_selects_on_labels() {
        let attrs: AttrsFn = Arc::new(|o| {
            let mut labels = Labels::new();
            let value = String::from_utf8(o.data.clone())
                .map_err(|e| StorageError::Invalid(e.to_string()))?;
            labels.insert("tier".into(), value);
            Ok((labels, Fields::new()))
        });
        let pred = Predicate::from_attrs(attrs, |labels, _| {
            labels.get("tier").map(String::as_str) == Some("web")
        });
        assert!(pred.matches(&obj(b"web")));
        assert!(!pred.matches(&obj(b"db")));
        // Extraction failure excludes the object rather than erroring.
        assert!(!pred.matches(&obj(&[0xff, 0xfe])));
    }
}
