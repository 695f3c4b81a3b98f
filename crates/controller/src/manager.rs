use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_cache::{Queue, StoreError};
use kiln_core::Key;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{Decision, GiveUpReason, Retry, RetryPolicy, TokenBucket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The item went back on the queue; `attempt` counts requeues this episode.
    Requeued { attempt: u32 },
    GaveUp(GiveUpReason),
    /// The give-up action failed, so the item went back on the queue with
    /// its episode intact.
    GiveUpFailed(GiveUpReason),
}

/// Owns retry state for failed items: requeues them or gives up on them.
#[async_trait::async_trait]
pub trait RetryManager<T>: Send + Sync {
    /// Record a failed attempt for `item` and requeue it or give up.
    async fn retry(&self, item: T, err: anyhow::Error) -> Result<RetryOutcome, StoreError>;

    /// Clear retry state after a success; the next failure starts a new episode.
    fn forget(&self, item: &T);
}

type Episodes = Arc<Mutex<FxHashMap<Key, Retry>>>;

fn episodes(retries: &Episodes) -> MutexGuard<'_, FxHashMap<Key, Retry>> {
    retries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`RetryManager`] that requeues into the queue the item came from.
///
/// Requeues go through [`Queue::add_if_not_present`] so a newer value that
/// arrived while the item was being handled is not clobbered, and every
/// requeue first takes a token from the shared [`TokenBucket`]. The manager
/// installs itself as the queue's removal hook, so an item dropped from the
/// queue while waiting for its retry takes its episode with it; use one
/// manager per queue.
pub struct QueueRetryManager<Q: Queue> {
    queue: Arc<Q>,
    policy: RetryPolicy<Q::Item>,
    limiter: Arc<TokenBucket>,
    retries: Episodes,
}

impl<Q: Queue> QueueRetryManager<Q> {
    pub fn new(queue: Arc<Q>, policy: RetryPolicy<Q::Item>, limiter: Arc<TokenBucket>) -> Self {
        let retries = Episodes::default();
        queue.on_removed({
            let retries = Arc::clone(&retries);
            Arc::new(move |key: &str| {
                if episodes(&retries).remove(key).is_some() {
                    debug!(key = %key, "retry: episode dropped with its queued item");
                }
            })
        });
        Self { queue, policy, limiter, retries }
    }

    /// Current episode for `key`, if it has failed since its last success.
    pub fn retry_state(&self, key: &str) -> Option<Retry> {
        self.retries().get(key).copied()
    }

    /// Keys with an open episode.
    pub fn tracked(&self) -> usize {
        self.retries().len()
    }

    fn retries(&self) -> MutexGuard<'_, FxHashMap<Key, Retry>> {
        episodes(&self.retries)
    }

    async fn requeue(&self, item: Q::Item) -> Result<(), StoreError> {
        self.limiter.accept().await;
        self.queue.add_if_not_present(item)
    }
}

#[async_trait::async_trait]
impl<Q: Queue> RetryManager<Q::Item> for QueueRetryManager<Q> {
    async fn retry(&self, item: Q::Item, err: anyhow::Error) -> Result<RetryOutcome, StoreError> {
        let key = self.queue.key_of(&item)?;
        let episode = *self.retries().entry(key.clone()).or_insert_with(Retry::start);

        match self.policy.decide(&err, &episode) {
            Decision::Retry => {
                self.requeue(item).await?;
                let attempt = {
                    let mut retries = self.retries();
                    let r = retries.entry(key.clone()).or_insert(episode);
                    r.count += 1;
                    r.count
                };
                metrics::counter!("controller_retries_total", 1u64);
                debug!(key = %key, attempt, error = %err, "retry: requeued");
                Ok(RetryOutcome::Requeued { attempt })
            }
            Decision::GiveUp(reason) => {
                metrics::counter!("controller_give_up_total", 1u64);
                warn!(key = %key, reason = %reason, error = %err, "retry: giving up");
                match self.policy.give_up(&item, &err).await {
                    Ok(()) => {
                        self.retries().remove(&key);
                        Ok(RetryOutcome::GaveUp(reason))
                    }
                    Err(e) => {
                        metrics::counter!("controller_give_up_failures_total", 1u64);
                        warn!(key = %key, error = %e, "retry: give-up action failed; requeueing");
                        self.requeue(item).await?;
                        self.retries().entry(key).or_insert(episode);
                        Ok(RetryOutcome::GiveUpFailed(reason))
                    }
                }
            }
        }
    }

    fn forget(&self, item: &Q::Item) {
        match self.queue.key_of(item) {
            Ok(key) => {
                self.retries().remove(&key);
            }
            Err(e) => debug!(error = %e, "retry: forget skipped; item has no key"),
        }
    }
}
