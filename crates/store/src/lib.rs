//! Lookout store: in-memory, indexed, watchable keyed storage.
//!
//! A `Store` holds the latest version of each object, keeps caller-declared
//! secondary indexes consistent with the primary map, and fans every mutation
//! out to registered watchers as a gap-free, per-watcher-ordered event
//! stream. Control planes use it to publish aggregated state (policy stats
//! and the like) to many concurrent consumers without polling.

#![forbid(unsafe_code)]

mod cache;
mod watch;

pub use cache::{IndexFn, Indexers};
pub use watch::WatchHandle;

use std::sync::{Arc, RwLock};

use lookout_core::{ExtractError, GenEventFn, InternalEvent, KeyFn, Selector, Selectors};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use cache::IndexedMap;
use watch::Watcher;

/// Capacity of each watcher queue (input and output).
pub(crate) const WATCH_CHAN_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error(transparent)]
    InvalidSelector(#[from] lookout_core::ParseError),
    #[error("store is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub(crate) struct Shared<T> {
    storage: IndexedMap<T>,
    version: u64,
    watchers: FxHashMap<u64, Arc<Watcher<T>>>,
    next_watcher_id: u64,
    stopped: bool,
}

/// The orchestrator: primary map, indexes, version counter and watcher
/// registry behind one lock. Mutations take the write half; reads share it.
pub struct Store<T> {
    key_fn: KeyFn<T>,
    gen_event: GenEventFn<T>,
    state: Arc<RwLock<Shared<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Store<T> {
    /// Build a store from a key function, named secondary indexers and an
    /// event factory. Indexes are fixed for the store's lifetime.
    pub fn new(key_fn: KeyFn<T>, indexers: Indexers<T>, gen_event: GenEventFn<T>) -> Self {
        let shared = Shared {
            storage: IndexedMap::new(indexers),
            version: 0,
            watchers: FxHashMap::default(),
            next_watcher_id: 0,
            stopped: false,
        };
        Self { key_fn, gen_event, state: Arc::new(RwLock::new(shared)) }
    }

    /// Insert a new object. Fails with `AlreadyExists` if its key is live.
    pub fn create(&self, obj: T) -> Result<()> {
        let key = (self.key_fn)(&obj)?;
        let mut st = self.state.write().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        if st.storage.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let version = st.version + 1;
        let event = (self.gen_event)(&key, None, Some(&obj), version)?;
        st.version = version;
        st.storage.add(key.clone(), obj, version);
        debug!(key = %key, version, "store: created");
        counter!("store_mutations_total", 1u64);
        if let Some(event) = event {
            dispatch(&mut st, event);
        }
        Ok(())
    }

    /// Replace an existing object wholesale. Fails with `NotFound` if its key
    /// is absent.
    pub fn update(&self, obj: T) -> Result<()> {
        let key = (self.key_fn)(&obj)?;
        let mut st = self.state.write().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        let (prev, prev_version) = match st.storage.get(&key) {
            Some(entry) => (entry.object.clone(), entry.version),
            None => return Err(StoreError::NotFound(key)),
        };
        let version = st.version + 1;
        let event = (self.gen_event)(&key, Some(&prev), Some(&obj), version)?;
        st.version = version;
        st.storage.update(&key, obj, version);
        debug!(key = %key, prev_version, version, "store: updated");
        counter!("store_mutations_total", 1u64);
        if let Some(event) = event {
            dispatch(&mut st, event);
        }
        Ok(())
    }

    /// Remove an object. Deleting an absent key reports `NotFound` and leaves
    /// the store unchanged.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut st = self.state.write().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        let (prev, prev_version) = match st.storage.get(key) {
            Some(entry) => (entry.object.clone(), entry.version),
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        let version = st.version + 1;
        let event = (self.gen_event)(key, Some(&prev), None, version)?;
        st.version = version;
        st.storage.delete(key);
        debug!(key = %key, prev_version, version, "store: deleted");
        counter!("store_mutations_total", 1u64);
        if let Some(event) = event {
            dispatch(&mut st, event);
        }
        Ok(())
    }

    /// Deep copy of the latest value for `key`, or `None`.
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        let st = self.state.read().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        Ok(st.storage.get(key).map(|entry| entry.object.clone()))
    }

    /// All objects whose `index_name` extractor yields `index_value`, in key
    /// order. Fails with `UnknownIndex` for an undeclared index.
    pub fn get_by_index(&self, index_name: &str, index_value: &str) -> Result<Vec<T>> {
        let st = self.state.read().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        st.storage
            .by_index(index_name, index_value)
            .ok_or_else(|| StoreError::UnknownIndex(index_name.to_string()))
    }

    /// Deep copies of every stored object, in key order.
    pub fn list(&self) -> Result<Vec<T>> {
        let st = self.state.read().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        Ok(st.storage.list())
    }

    /// Version assigned to the most recent mutation (0 on a fresh store).
    pub fn version(&self) -> u64 {
        self.state.read().unwrap().version
    }

    /// Register a watcher. Its channel first yields one `Added` event per
    /// entry alive right now (in key order), then every later mutation its
    /// selectors admit, in version order, with no gaps and no duplicates.
    /// The stream ends (channel closes) on [`WatchHandle::stop`], handle
    /// drop, store stop, or when the watcher cannot keep up.
    pub fn watch(&self, selectors: Selectors) -> Result<WatchHandle<T>> {
        let mut st = self.state.write().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        // Build the snapshot burst before the watcher exists so a factory
        // error leaves nothing behind.
        let mut init: Vec<Arc<dyn InternalEvent<T>>> = Vec::with_capacity(st.storage.len());
        for (key, entry) in st.storage.entries_sorted() {
            if let Some(event) = (self.gen_event)(key, None, Some(&entry.object), st.version)? {
                init.push(event);
            }
        }
        let id = st.next_watcher_id;
        st.next_watcher_id += 1;
        // The input queue must absorb the whole burst before the delivery
        // loop gets a chance to run.
        let input_cap = WATCH_CHAN_SIZE.max(init.len());
        let (watcher, handle) =
            Watcher::spawn(id, selectors, input_cap, Arc::downgrade(&self.state));
        let burst = init.len();
        for event in init {
            let _ = watcher.add(event);
        }
        st.watchers.insert(id, watcher);
        info!(watcher = id, init_events = burst, version = st.version, "store: watcher registered");
        histogram!("store_watch_init_events", burst as f64);
        Ok(handle)
    }

    /// Convenience over [`watch`](Self::watch): parse label and field
    /// expressions like `"app=nginx,env!=prod"` into selectors first. Empty
    /// expressions select everything; an unparseable one fails with
    /// `InvalidSelector`.
    pub fn watch_expr(
        &self,
        key: Option<&str>,
        label_expr: &str,
        field_expr: &str,
    ) -> Result<WatchHandle<T>> {
        let selectors = Selectors::new(
            key.map(|k| k.to_string()),
            Selector::parse(label_expr)?,
            Selector::parse(field_expr)?,
        );
        self.watch(selectors)
    }

    /// Terminate every watcher and refuse further operations. Idempotent.
    pub fn stop(&self) {
        let mut st = self.state.write().unwrap();
        if st.stopped {
            return;
        }
        st.stopped = true;
        info!(watchers = st.watchers.len(), "store: stopping");
        for (_, watcher) in st.watchers.drain() {
            watcher.terminate();
        }
    }
}

/// Fan an event out to every watcher. Never blocks: a watcher whose input
/// queue is full is terminated and dropped from the registry.
fn dispatch<T>(st: &mut Shared<T>, event: Arc<dyn InternalEvent<T>>) {
    counter!("store_events_total", 1u64);
    let mut dead = Vec::new();
    for (id, watcher) in st.watchers.iter() {
        if !watcher.add(Arc::clone(&event)) {
            warn!(watcher = *id, "store: watcher queue full, terminating");
            counter!("store_watcher_overflow_total", 1u64);
            watcher.terminate();
            dead.push(*id);
        }
    }
    for id in dead {
        st.watchers.remove(&id);
    }
}
