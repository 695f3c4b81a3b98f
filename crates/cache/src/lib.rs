//! Kiln cache: keyed stores and the two queue disciplines that feed controllers.
//!
//! - [`Fifo`]: one pending value per key, latest value wins, first-enqueue position kept.
//! - [`DeltaFifo`]: ordered delta history per key, with deletion reconciliation on relist.
//! - [`ObjectCache`]: plain keyed store without a queue (read-side cache).

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_core::{Key, KeyError};

mod cache;
mod delta_fifo;
mod fifo;
mod known;

pub use cache::ObjectCache;
pub use delta_fifo::DeltaFifo;
pub use fifo::Fifo;
pub use known::{AlwaysKnown, KnownObjects};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("queue is closed")]
    Closed,
    #[error("empty delta list has no key")]
    EmptyDeltas,
}

/// Producer-side contract: what a reflector writes into.
///
/// Implementations are internally synchronized; callers never lock.
pub trait Store<K>: Send + Sync {
    fn add(&self, obj: K) -> Result<(), StoreError>;
    fn update(&self, obj: K) -> Result<(), StoreError>;
    fn delete(&self, obj: K) -> Result<(), StoreError>;
    fn list(&self) -> Vec<K>;
    fn list_keys(&self) -> Vec<Key>;
    fn get_by_key(&self, key: &str) -> Option<K>;
    /// Swap in an authoritative snapshot taken at `resource_version`.
    fn replace(&self, objs: Vec<K>, resource_version: &str) -> Result<(), StoreError>;
}

/// Called with the key of a pending item that a queue dropped without
/// handing it to a consumer.
pub type RemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Consumer-side contract: what a controller pops from and requeues into.
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    type Item: Clone + Send + Sync + 'static;

    /// Wait for the longest-pending item. Returns [`StoreError::Closed`] once
    /// the queue is closed and drained. Cancel-safe: an item is only removed
    /// when the returned future completes.
    async fn pop(&self) -> Result<Self::Item, StoreError>;

    /// Requeue `item` unless its key is already pending (a newer value wins).
    fn add_if_not_present(&self, item: Self::Item) -> Result<(), StoreError>;

    fn key_of(&self, item: &Self::Item) -> Result<Key, StoreError>;

    /// Wake every blocked `pop`; further pops drain what is left then fail.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Register `hook` for pending keys dropped without being popped (deleted,
    /// or left out of a replace). Queues that never drop a pending key ignore it.
    fn on_removed(&self, _hook: RemovalHook) {}

    /// Number of pending keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock that survives a panicked holder; every critical section here leaves
/// the maps consistent before it can unwind.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
