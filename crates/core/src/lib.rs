//! Lookout core types: attribute sets, selectors and change events shared by
//! the store and its payload crates.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod event;
pub mod selector;

pub use event::{gen_change_event, ChangeEvent, EventKind, InternalEvent, ObjectState, WatchEvent};
pub use selector::{ParseError, Selector, Selectors};

/// A small string-keyed attribute set. Keys are kept sorted so lookups are a
/// binary search and equality is order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSet(SmallVec<[(String, String); 8]>);

impl AttrSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AttrSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut pairs: SmallVec<[(String, String); 8]> =
            iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        // Last write wins on duplicate keys
        pairs.reverse();
        pairs.dedup_by(|a, b| a.0 == b.0);
        pairs.reverse();
        Self(pairs)
    }
}

/// The two attribute sets selectors match against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub labels: AttrSet,
    pub fields: AttrSet,
}

/// Raised when a caller-supplied key or attribute function rejects an object.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ExtractError(pub String);

impl ExtractError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Derives the stable key of an object.
pub type KeyFn<T> = Box<dyn Fn(&T) -> Result<String, ExtractError> + Send + Sync>;

/// Derives the (labels, fields) attribute sets of an object.
pub type AttrsFn<T> = Arc<dyn Fn(&T) -> Result<Attributes, ExtractError> + Send + Sync>;

/// Builds the internal event for one mutation, given (key, prev, cur, version).
/// Returning `Ok(None)` means prev and cur are equivalent and no event should
/// be fanned out.
pub type GenEventFn<T> = Box<
    dyn Fn(
            &str,
            Option<&T>,
            Option<&T>,
            u64,
        ) -> Result<Option<Arc<dyn InternalEvent<T>>>, ExtractError>
        + Send
        + Sync,
>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrset_sorted_lookup() {
        let s: AttrSet = [("b", "2"), ("a", "1"), ("c", "3")].into_iter().collect();
        assert_eq!(s.get("a"), Some("1"));
        assert_eq!(s.get("b"), Some("2"));
        assert_eq!(s.get("c"), Some("3"));
        assert_eq!(s.get("d"), None);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn attrset_duplicate_keys_last_wins() {
        let s: AttrSet = [("a", "1"), ("a", "2")].into_iter().collect();
        assert_eq!(s.get("a"), Some("2"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn attrset_equality_ignores_insertion_order() {
        let a: AttrSet = [("x", "1"), ("y", "2")].into_iter().collect();
        let b: AttrSet = [("y", "2"), ("x", "1")].into_iter().collect();
        assert_eq!(a, b);
    }
}
