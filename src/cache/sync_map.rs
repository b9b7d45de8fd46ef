//! A string-keyed map with one coarse mutex per operation.
//!
//! This is the key index of the keyed cache and the only structure which background refresh tasks
//! may touch without holding the cache's exclusive section, so its internal locking is load
//! bearing. All operations are O(1) and hold the lock only for the duration of a single hash map
//! access, which makes one coarse mutex perfectly adequate - sharding would buy nothing here.
use fnv::FnvHashMap;
use std::sync::Mutex;

/// A concurrency-safe map from string keys to cheaply cloneable values.
pub(crate) struct SyncMap<V> {
    dict: Mutex<FnvHashMap<String, V>>,
}

impl<V: Clone> SyncMap<V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        SyncMap {
            dict: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Returns a copy of the value stored for the given key, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        self.dict.lock().unwrap().get(key).cloned()
    }

    /// Stores the given value for the given key, replacing any previous value.
    pub fn set(&self, key: String, value: V) {
        let _ = self.dict.lock().unwrap().insert(key, value);
    }

    /// Removes the value stored for the given key, if any.
    pub fn delete(&self, key: &str) {
        let _ = self.dict.lock().unwrap().remove(key);
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.dict.lock().unwrap().len()
    }

    /// Removes all keys.
    pub fn clear(&self) {
        self.dict.lock().unwrap().clear();
    }
}
