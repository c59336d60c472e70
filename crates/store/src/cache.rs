//! Primary keyed storage plus named secondary indexes. No locking here; the
//! store serializes all access.

use std::collections::HashMap;

use rustc_hash::{FxHashMap, FxHashSet};

/// Extracts the index values of an object for one named index. Indexers are
/// pure functions of the object.
pub type IndexFn<T> = Box<dyn Fn(&T) -> Vec<String> + Send + Sync>;

/// Named secondary indexes, declared once at store construction.
pub type Indexers<T> = HashMap<String, IndexFn<T>>;

pub(crate) struct Entry<T> {
    pub object: T,
    /// Version of the mutation that last touched this key.
    pub version: u64,
}

pub(crate) struct IndexedMap<T> {
    items: FxHashMap<String, Entry<T>>,
    indexers: Indexers<T>,
    // index name -> index value -> keys of objects yielding that value
    indices: FxHashMap<String, FxHashMap<String, FxHashSet<String>>>,
}

impl<T: Clone> IndexedMap<T> {
    pub fn new(indexers: Indexers<T>) -> Self {
        let indices = indexers.keys().map(|name| (name.clone(), FxHashMap::default())).collect();
        Self { items: FxHashMap::default(), indexers, indices }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Entry<T>> {
        self.items.get(key)
    }

    /// Insert under a key the caller has checked to be absent.
    pub fn add(&mut self, key: String, object: T, version: u64) {
        self.update_indices(&key, None, Some(&object));
        self.items.insert(key, Entry { object, version });
    }

    /// Replace under a key the caller has checked to be present.
    pub fn update(&mut self, key: &str, object: T, version: u64) {
        let old = self.items.remove(key);
        self.update_indices(key, old.as_ref().map(|e| &e.object), Some(&object));
        self.items.insert(key.to_string(), Entry { object, version });
    }

    pub fn delete(&mut self, key: &str) -> Option<Entry<T>> {
        let entry = self.items.remove(key)?;
        self.update_indices(key, Some(&entry.object), None);
        Some(entry)
    }

    /// All objects, cloned, in key order.
    pub fn list(&self) -> Vec<T> {
        self.entries_sorted().into_iter().map(|(_, e)| e.object.clone()).collect()
    }

    /// All entries in key order; the deterministic enumeration snapshots and
    /// `list` are built from.
    pub fn entries_sorted(&self) -> Vec<(&str, &Entry<T>)> {
        let mut out: Vec<_> = self.items.iter().map(|(k, e)| (k.as_str(), e)).collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    /// Objects whose index set for `name` contains `value`, cloned, in key
    /// order. `None` for an undeclared index.
    pub fn by_index(&self, name: &str, value: &str) -> Option<Vec<T>> {
        let index = self.indices.get(name)?;
        let mut keys: Vec<&String> =
            index.get(value).map(|set| set.iter().collect()).unwrap_or_default();
        keys.sort();
        Some(keys.into_iter().map(|k| self.items[k].object.clone()).collect())
    }

    /// Subtract the old object's index entries and add the new object's, for
    /// every declared index.
    fn update_indices(&mut self, key: &str, old: Option<&T>, new: Option<&T>) {
        for (name, index_fn) in &self.indexers {
            let index = self
                .indices
                .get_mut(name)
                .expect("indices are seeded for every declared indexer");
            if let Some(old) = old {
                for value in index_fn(old) {
                    let emptied = match index.get_mut(&value) {
                        Some(set) => {
                            set.remove(key);
                            set.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        index.remove(&value);
                    }
                }
            }
            if let Some(new) = new {
                for value in index_fn(new) {
                    index.entry(value).or_default().insert(key.to_string());
                }
            }
        }
    }
}
