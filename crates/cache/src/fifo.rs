use std::collections::VecDeque;
use std::sync::Mutex;

use kiln_core::{meta_namespace_key, Key, KeyFunc, Object};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::{lock, Queue, RemovalHook, Store, StoreError};

/// Coalescing queue keyed by object key with FIFO order.
///
/// A key is pending at most once. Re-adding a pending key overwrites its value
/// in place; the key keeps the position of its first enqueue.
pub struct Fifo<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    key_fn: KeyFunc<K>,
    name: String,
    on_removed: Mutex<Option<RemovalHook>>,
}

struct Inner<K> {
    items: FxHashMap<Key, K>,
    order: VecDeque<Key>,
    closed: bool,
}

impl<K> Inner<K> {
    fn pop_front(&mut self) -> Option<K> {
        while let Some(key) = self.order.pop_front() {
            if let Some(obj) = self.items.remove(&key) {
                return Some(obj);
            }
        }
        None
    }
}

impl<K: Object> Fifo<K> {
    pub fn new() -> Self {
        Self::with_key_fn(meta_namespace_key::<K>)
    }
}

impl<K: Object> Default for Fifo<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Send + Sync + 'static> Fifo<K> {
    pub fn with_key_fn(key_fn: KeyFunc<K>) -> Self {
        Self {
            inner: Mutex::new(Inner { items: FxHashMap::default(), order: VecDeque::new(), closed: false }),
            notify: Notify::new(),
            key_fn,
            name: "fifo".to_string(),
            on_removed: Mutex::new(None),
        }
    }

    /// Label used for the `queue_depth` gauge.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn report_depth(&self, depth: usize) {
        metrics::gauge!("queue_depth", depth as f64, "queue" => self.name.clone());
    }

    /// Runs outside the queue lock so hooks may call back into the queue.
    fn removed(&self, keys: &[Key]) {
        if keys.is_empty() {
            return;
        }
        let hook = lock(&self.on_removed).clone();
        if let Some(hook) = hook {
            for key in keys {
                hook(key);
            }
        }
    }

    fn enqueue(&self, obj: K) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        let depth = {
            let mut inner = lock(&self.inner);
            if !inner.items.contains_key(&key) {
                inner.order.push_back(key.clone());
            }
            inner.items.insert(key, obj);
            inner.items.len()
        };
        self.report_depth(depth);
        self.notify.notify_one();
        Ok(())
    }
}

impl<K: Clone + Send + Sync + 'static> Store<K> for Fifo<K> {
    fn add(&self, obj: K) -> Result<(), StoreError> {
        self.enqueue(obj)
    }

    fn update(&self, obj: K) -> Result<(), StoreError> {
        self.enqueue(obj)
    }

    fn delete(&self, obj: K) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        let depth = {
            let mut inner = lock(&self.inner);
            if inner.items.remove(&key).is_none() {
                return Ok(());
            }
            inner.order.retain(|k| k != &key);
            inner.items.len()
        };
        self.report_depth(depth);
        self.removed(&[key]);
        Ok(())
    }

    fn list(&self) -> Vec<K> {
        let inner = lock(&self.inner);
        inner.order.iter().filter_map(|k| inner.items.get(k).cloned()).collect()
    }

    fn list_keys(&self) -> Vec<Key> {
        lock(&self.inner).order.iter().cloned().collect()
    }

    fn get_by_key(&self, key: &str) -> Option<K> {
        lock(&self.inner).items.get(key).cloned()
    }

    /// Pending values not present in `objs` are dropped; the new queue follows
    /// snapshot order.
    fn replace(&self, objs: Vec<K>, resource_version: &str) -> Result<(), StoreError> {
        let mut items: FxHashMap<Key, K> = FxHashMap::default();
        let mut order = VecDeque::with_capacity(objs.len());
        for obj in objs {
            let key = (self.key_fn)(&obj)?;
            if !items.contains_key(&key) {
                order.push_back(key.clone());
            }
            items.insert(key, obj);
        }
        let depth = items.len();
        let dropped: Vec<Key> = {
            let mut inner = lock(&self.inner);
            let old = std::mem::replace(&mut inner.items, items);
            inner.order = order;
            old.into_keys().filter(|k| !inner.items.contains_key(k)).collect()
        };
        debug!(queue = %self.name, rv = %resource_version, depth, dropped = dropped.len(), "fifo: replaced");
        self.report_depth(depth);
        self.notify.notify_waiters();
        self.removed(&dropped);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K: Clone + Send + Sync + 'static> Queue for Fifo<K> {
    type Item = K;

    async fn pop(&self) -> Result<K, StoreError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let popped = {
                let mut inner = lock(&self.inner);
                match inner.pop_front() {
                    Some(obj) => Some(Ok((obj, inner.items.len()))),
                    None if inner.closed => Some(Err(StoreError::Closed)),
                    None => None,
                }
            };
            match popped {
                Some(Ok((obj, depth))) => {
                    self.report_depth(depth);
                    return Ok(obj);
                }
                Some(Err(e)) => return Err(e),
                None => notified.await,
            }
        }
    }

    fn add_if_not_present(&self, obj: K) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        let depth = {
            let mut inner = lock(&self.inner);
            if inner.items.contains_key(&key) {
                return Ok(());
            }
            inner.order.push_back(key.clone());
            inner.items.insert(key, obj);
            inner.items.len()
        };
        self.report_depth(depth);
        self.notify.notify_one();
        Ok(())
    }

    fn key_of(&self, obj: &K) -> Result<Key, StoreError> {
        Ok((self.key_fn)(obj)?)
    }

    fn close(&self) {
        lock(&self.inner).closed = true;
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    fn on_removed(&self, hook: RemovalHook) {
        *lock(&self.on_removed) = Some(hook);
    }

    fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }
}
