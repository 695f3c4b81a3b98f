use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use kiln_core::{meta_namespace_key, Delta, DeltaType, Deltas, Key, KeyFunc, Object};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

use crate::{lock, KnownObjects, Queue, Store, StoreError};

/// Queue of per-key delta histories.
///
/// Same discipline as [`Fifo`](crate::Fifo) but every write appends a delta to
/// the key's history instead of overwriting it, and [`pop`](Queue::pop) hands
/// out the whole history for the longest-waiting key.
///
/// Unless a [`KnownObjects`] override is supplied, the queue remembers the last
/// observed state of every key (dropped again on deletion). `replace` uses that
/// memory to synthesize a tombstone for every key missing from the snapshot, so
/// a deletion whose watch event was lost still reaches the consumer.
pub struct DeltaFifo<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    key_fn: KeyFunc<K>,
    known: Option<Arc<dyn KnownObjects<K>>>,
    name: String,
}

struct Inner<K> {
    items: FxHashMap<Key, Deltas<K>>,
    order: VecDeque<Key>,
    /// Last observed state per key; only maintained without a `known` override.
    seen: FxHashMap<Key, K>,
    populated: bool,
    initial_population: usize,
    closed: bool,
}

impl<K> Inner<K> {
    fn pop_front(&mut self) -> Option<Deltas<K>> {
        while let Some(key) = self.order.pop_front() {
            if let Some(deltas) = self.items.remove(&key) {
                self.initial_population = self.initial_population.saturating_sub(1);
                return Some(deltas);
            }
        }
        None
    }

    fn has_pending_deletion(&self, key: &str) -> bool {
        self.items
            .get(key)
            .and_then(|ds| ds.newest())
            .is_some_and(|d| d.kind == DeltaType::Deleted)
    }

    fn push(&mut self, key: Key, delta: Delta<K>) {
        match self.items.get_mut(&key) {
            Some(ds) => ds.push(delta),
            None => {
                let mut ds = Deltas::default();
                ds.push(delta);
                self.order.push_back(key.clone());
                self.items.insert(key, ds);
            }
        }
    }
}

impl<K: Object> DeltaFifo<K> {
    pub fn new() -> Self {
        Self::with_key_fn(meta_namespace_key::<K>)
    }
}

impl<K: Object> Default for DeltaFifo<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Send + Sync + 'static> DeltaFifo<K> {
    pub fn with_key_fn(key_fn: KeyFunc<K>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                seen: FxHashMap::default(),
                populated: false,
                initial_population: 0,
                closed: false,
            }),
            notify: Notify::new(),
            key_fn,
            known: None,
            name: "delta_fifo".to_string(),
        }
    }

    /// Delegate "which keys exist locally" to `known` instead of the built-in
    /// memory of observed objects.
    pub fn with_known_objects(mut self, known: Arc<dyn KnownObjects<K>>) -> Self {
        self.known = Some(known);
        self
    }

    /// Label used for the `queue_depth` gauge.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// True once the first `replace` landed and every item it queued was popped.
    pub fn has_synced(&self) -> bool {
        let inner = lock(&self.inner);
        inner.populated && inner.initial_population == 0
    }

    fn report_depth(&self, depth: usize) {
        metrics::gauge!("queue_depth", depth as f64, "queue" => self.name.clone());
    }

    fn is_known(&self, inner: &Inner<K>, key: &str) -> bool {
        match &self.known {
            Some(known) => known.contains_key(key),
            None => inner.seen.contains_key(key),
        }
    }

    /// Append under the lock; caller notifies.
    fn queue_action_locked(&self, inner: &mut Inner<K>, kind: DeltaType, obj: K) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        if self.known.is_none() {
            match kind {
                DeltaType::Deleted => {
                    inner.seen.remove(&key);
                }
                _ => {
                    inner.seen.insert(key.clone(), obj.clone());
                }
            }
        }
        inner.push(key, Delta::new(kind, obj));
        Ok(())
    }

    fn queue_action(&self, kind: DeltaType, obj: K) -> Result<(), StoreError> {
        let depth = {
            let mut inner = lock(&self.inner);
            inner.populated = true;
            self.queue_action_locked(&mut inner, kind, obj)?;
            inner.items.len()
        };
        self.report_depth(depth);
        self.notify.notify_one();
        Ok(())
    }
}

impl<K: Clone + Send + Sync + 'static> Store<K> for DeltaFifo<K> {
    fn add(&self, obj: K) -> Result<(), StoreError> {
        self.queue_action(DeltaType::Added, obj)
    }

    fn update(&self, obj: K) -> Result<(), StoreError> {
        self.queue_action(DeltaType::Updated, obj)
    }

    /// Deleting a key that is neither pending nor known is a no-op: the
    /// deletion was already reported by a relist.
    fn delete(&self, obj: K) -> Result<(), StoreError> {
        let key = (self.key_fn)(&obj)?;
        let depth = {
            let mut inner = lock(&self.inner);
            inner.populated = true;
            if !inner.items.contains_key(&key) && !self.is_known(&inner, &key) {
                debug!(queue = %self.name, key = %key, "delta_fifo: delete of unknown key ignored");
                return Ok(());
            }
            self.queue_action_locked(&mut inner, DeltaType::Deleted, obj)?;
            inner.items.len()
        };
        self.report_depth(depth);
        self.notify.notify_one();
        Ok(())
    }

    /// Newest state of every pending key.
    fn list(&self) -> Vec<K> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter_map(|k| inner.items.get(k))
            .filter_map(|ds| ds.newest())
            .filter_map(|d| d.object.object().cloned())
            .collect()
    }

    fn list_keys(&self) -> Vec<Key> {
        lock(&self.inner).order.iter().cloned().collect()
    }

    fn get_by_key(&self, key: &str) -> Option<K> {
        let inner = lock(&self.inner);
        inner.items.get(key).and_then(|ds| ds.newest()).and_then(|d| d.object.object().cloned())
    }

    /// Queue a `Sync` delta for every listed object, then a tombstone for every
    /// locally known key the snapshot no longer contains (unless a deletion is
    /// already pending for it).
    fn replace(&self, objs: Vec<K>, resource_version: &str) -> Result<(), StoreError> {
        let (depth, listed, tombstones) = {
            let mut inner = lock(&self.inner);
            let mut listed: FxHashSet<Key> = FxHashSet::default();
            for obj in objs {
                listed.insert((self.key_fn)(&obj)?);
                self.queue_action_locked(&mut inner, DeltaType::Sync, obj)?;
            }
            let listed_count = listed.len();

            let mut missing: Vec<(Key, Option<K>)> = match &self.known {
                Some(known) => known
                    .list_keys()
                    .into_iter()
                    .filter(|k| !listed.contains(k))
                    .map(|k| {
                        let last = known.get_by_key(&k);
                        (k, last)
                    })
                    .collect(),
                None => {
                    let mut keys: FxHashSet<Key> = inner.seen.keys().cloned().collect();
                    keys.extend(inner.items.keys().cloned());
                    keys.into_iter()
                        .filter(|k| !listed.contains(k))
                        .map(|k| {
                            let last = inner.seen.get(&k).cloned().or_else(|| {
                                inner
                                    .items
                                    .get(&k)
                                    .and_then(|ds| ds.newest())
                                    .and_then(|d| d.object.object().cloned())
                            });
                            (k, last)
                        })
                        .collect()
                }
            };
            missing.sort_by(|a, b| a.0.cmp(&b.0));

            let mut tombstones = 0usize;
            for (key, last_known) in missing {
                if inner.has_pending_deletion(&key) {
                    continue;
                }
                inner.seen.remove(&key);
                inner.push(key.clone(), Delta::tombstone(key, last_known));
                tombstones += 1;
            }

            if !inner.populated {
                inner.populated = true;
                inner.initial_population = inner.items.len();
            }
            (inner.items.len(), listed_count, tombstones)
        };
        debug!(queue = %self.name, rv = %resource_version, listed, tombstones, "delta_fifo: replaced");
        self.report_depth(depth);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K: Clone + Send + Sync + 'static> Queue for DeltaFifo<K> {
    type Item = Deltas<K>;

    async fn pop(&self) -> Result<Deltas<K>, StoreError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let popped = {
                let mut inner = lock(&self.inner);
                match inner.pop_front() {
                    Some(ds) => Some(Ok((ds, inner.items.len()))),
                    None if inner.closed => Some(Err(StoreError::Closed)),
                    None => None,
                }
            };
            match popped {
                Some(Ok((ds, depth))) => {
                    self.report_depth(depth);
                    return Ok(ds);
                }
                Some(Err(e)) => return Err(e),
                None => notified.await,
            }
        }
    }

    fn add_if_not_present(&self, deltas: Deltas<K>) -> Result<(), StoreError> {
        let key = self.key_of(&deltas)?;
        {
            let mut inner = lock(&self.inner);
            if inner.items.contains_key(&key) {
                return Ok(());
            }
            inner.order.push_back(key.clone());
            inner.items.insert(key, deltas);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn key_of(&self, deltas: &Deltas<K>) -> Result<Key, StoreError> {
        let newest = deltas.newest().ok_or(StoreError::EmptyDeltas)?;
        Ok(newest.object.key(self.key_fn)?)
    }

    fn close(&self) {
        lock(&self.inner).closed = true;
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }
}
