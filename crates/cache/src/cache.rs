use std::sync::Mutex;

use kiln_core::{meta_namespace_key, Key, KeyFunc, Object};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{lock, KnownObjects, Store, StoreError};

/// Plain keyed store: the latest state of every object, no queue.
///
/// A reflector can keep one warm for handlers to read from, and it can back a
/// [`DeltaFifo`](crate::DeltaFifo) as its [`KnownObjects`].
pub struct ObjectCache<K> {
    items: Mutex<FxHashMap<Key, K>>,
    key_fn: KeyFunc<K>,
}

impl<K: Object> ObjectCache<K> {
    pub fn new() -> Self {
        Self::with_key_fn(meta_namespace_key::<K>)
    }
}

impl<K: Object> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Send + Sync> ObjectCache<K> {
    pub fn with_key_fn(key_fn: KeyFunc<K>) -> Self {
        Self { items: Mutex::new(FxHashMap::default()), key_fn }
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, obj: K) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        lock(&self.items).insert(key, obj);
        Ok(())
    }
}

impl<K: Clone + Send + Sync> Store<K> for ObjectCache<K> {
    fn add(&self, obj: K) -> Result<(), StoreError> {
        self.put(obj)
    }

    fn update(&self, obj: K) -> Result<(), StoreError> {
        self.put(obj)
    }

    fn delete(&self, obj: K) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        lock(&self.items).remove(&key);
        Ok(())
    }

    fn list(&self) -> Vec<K> {
        lock(&self.items).values().cloned().collect()
    }

    fn list_keys(&self) -> Vec<Key> {
        lock(&self.items).keys().cloned().collect()
    }

    fn get_by_key(&self, key: &str) -> Option<K> {
        lock(&self.items).get(key).cloned()
    }

    fn replace(&self, objs: Vec<K>, resource_version: &str) -> Result<(), StoreError> {
        let mut items = FxHashMap::default();
        for obj in objs {
            items.insert((self.key_fn)(&obj)?, obj);
        }
        let count = items.len();
        *lock(&self.items) = items;
        debug!(rv = %resource_version, count, "cache: replaced");
        Ok(())
    }
}

impl<K: Clone + Send + Sync> KnownObjects<K> for ObjectCache<K> {
    fn list_keys(&self) -> Vec<Key> {
        Store::list_keys(self)
    }

    fn contains_key(&self, key: &str) -> bool {
        lock(&self.items).contains_key(key)
    }

    fn get_by_key(&self, key: &str) -> Option<K> {
        Store::get_by_key(self, key)
    }
}
