//! Change events: what watchers receive, and the internal representation that
//! carries enough pre- and post-mutation state to filter per subscriber
//! without re-consulting the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::selector::Selectors;
use crate::{Attributes, AttrsFn, ExtractError, GenEventFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// What a watch consumer receives. The object is a deep copy of the stored
/// value at the event's version; for `Deleted`, the value at deletion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    pub kind: EventKind,
    pub object: T,
}

/// An internal change record, shared across all watchers of a store. Each
/// watcher's delivery loop projects it through its own selectors.
pub trait InternalEvent<T>: Send + Sync {
    /// Version assigned to the mutation that produced this event.
    fn version(&self) -> u64;

    /// The event this subscriber should observe, or `None` when the change is
    /// invisible to it.
    fn to_watch_event(&self, selectors: &Selectors) -> Option<WatchEvent<T>>;
}

/// One side of a change: the object and the attributes it carried.
#[derive(Debug, Clone)]
pub struct ObjectState<T> {
    pub object: T,
    pub attrs: Attributes,
}

/// The shipped [`InternalEvent`] implementation: a tagged record of one
/// mutation with both sides of the change.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
    pub kind: EventKind,
    pub key: String,
    pub version: u64,
    /// Present unless the object was deleted.
    pub cur: Option<ObjectState<T>>,
    /// Present unless the object was just added.
    pub prev: Option<ObjectState<T>>,
}

impl<T: Clone + Send + Sync> InternalEvent<T> for ChangeEvent<T> {
    fn version(&self) -> u64 {
        self.version
    }

    fn to_watch_event(&self, selectors: &Selectors) -> Option<WatchEvent<T>> {
        let passes = |s: &ObjectState<T>| {
            selectors.matches(&self.key, &s.attrs.labels, &s.attrs.fields)
        };
        let cur_passes =
            self.kind != EventKind::Deleted && self.cur.as_ref().map_or(false, passes);
        let prev_passes = self.prev.as_ref().map_or(false, passes);

        match (cur_passes, prev_passes) {
            (true, false) => Some(WatchEvent {
                kind: EventKind::Added,
                object: self.cur.as_ref()?.object.clone(),
            }),
            (true, true) => Some(WatchEvent {
                kind: EventKind::Modified,
                object: self.cur.as_ref()?.object.clone(),
            }),
            // The object moved out of this subscriber's selection; report the
            // pre-transition state as a deletion.
            (false, true) => Some(WatchEvent {
                kind: EventKind::Deleted,
                object: self.prev.as_ref()?.object.clone(),
            }),
            (false, false) => None,
        }
    }
}

/// Adapt an attribute extractor into an event factory producing
/// [`ChangeEvent`]s. Mutations where prev equals cur are suppressed.
pub fn gen_change_event<T>(attrs_fn: AttrsFn<T>) -> GenEventFn<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    Box::new(move |key, prev, cur, version| {
        if prev == cur {
            return Ok(None);
        }
        let state = |obj: &T| -> Result<ObjectState<T>, ExtractError> {
            Ok(ObjectState { object: obj.clone(), attrs: attrs_fn(obj)? })
        };
        let kind = match (prev, cur) {
            (None, Some(_)) => EventKind::Added,
            (Some(_), None) => EventKind::Deleted,
            _ => EventKind::Modified,
        };
        let event = ChangeEvent {
            kind,
            key: key.to_string(),
            version,
            cur: cur.map(state).transpose()?,
            prev: prev.map(state).transpose()?,
        };
        Ok(Some(Arc::new(event) as Arc<dyn InternalEvent<T>>))
    })
}
