use std::sync::Arc;
use std::time::Instant;

use kiln_cache::{Queue, StoreError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{run_guarded, HandleError, Handler, Plug, RetryManager, RetryOutcome};

/// Worker loop over one queue.
///
/// Each worker waits for the [`Plug`] to open, pops an item (abandoning the
/// pop if the plug closes first), runs the [`Handler`] under panic
/// containment, then either clears the item's retry state (success) or hands
/// it to the [`RetryManager`] (failure). A single
/// item's failure or panic never ends the loop; only `stop` or a closed queue
/// does.
pub struct RetryController<Q: Queue> {
    name: String,
    queue: Arc<Q>,
    manager: Arc<dyn RetryManager<Q::Item>>,
    handler: Arc<dyn Handler<Q::Item>>,
    plug: Arc<Plug>,
    workers: usize,
}

impl<Q: Queue + 'static> RetryController<Q> {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<Q>,
        manager: Arc<dyn RetryManager<Q::Item>>,
        handler: Arc<dyn Handler<Q::Item>>,
    ) -> Self {
        Self { name: name.into(), queue, manager, handler, plug: Arc::new(Plug::new(true)), workers: 1 }
    }

    pub fn with_plug(mut self, plug: Arc<Plug>) -> Self {
        self.plug = plug;
        self
    }

    /// Number of concurrent workers sharing the queue and retry manager.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn spawn(self: Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    /// Run every worker until `stop` fires or the queue is closed and drained.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        info!(controller = %self.name, workers = self.workers, "controller: started");
        let mut set = JoinSet::new();
        for id in 0..self.workers {
            let this = Arc::clone(&self);
            let stop = stop.clone();
            set.spawn(async move { this.worker(id, stop).await });
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(controller = %self.name, error = %e, "controller: worker aborted");
            }
        }
        info!(controller = %self.name, "controller: stopped");
    }

    async fn worker(&self, id: usize, stop: CancellationToken) {
        loop {
            if !self.plug.is_open() {
                debug!(controller = %self.name, worker = id, "controller: paused");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = self.plug.wait_open() => {}
                }
            }
            // `pop` is cancel-safe, so losing the race to a closing plug
            // leaves the item queued.
            let popped = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.plug.wait_closed() => continue,
                r = self.queue.pop() => r,
            };
            match popped {
                Ok(item) => self.process(item).await,
                Err(StoreError::Closed) => {
                    debug!(controller = %self.name, worker = id, "controller: queue closed");
                    break;
                }
                Err(e) => warn!(controller = %self.name, worker = id, error = %e, "controller: pop failed"),
            }
        }
    }

    async fn process(&self, item: Q::Item) {
        let key = self.queue.key_of(&item).unwrap_or_default();
        let started = Instant::now();
        let handler = Arc::clone(&self.handler);
        let attempt = item.clone();
        let res = run_guarded(async move { handler.handle(attempt).await }).await;
        metrics::histogram!("controller_handle_ms", started.elapsed().as_secs_f64() * 1000.0);

        let err = match res {
            Ok(()) => {
                metrics::counter!("controller_handle_total", 1u64, "outcome" => "success");
                debug!(controller = %self.name, key = %key, "controller: handled");
                self.manager.forget(&item);
                return;
            }
            Err(HandleError::Panicked(msg)) => {
                metrics::counter!("controller_panics_total", 1u64);
                metrics::counter!("controller_handle_total", 1u64, "outcome" => "panic");
                error!(controller = %self.name, key = %key, panic = %msg, "controller: handler panicked");
                HandleError::Panicked(msg).into_error()
            }
            Err(HandleError::Failed(e)) => {
                metrics::counter!("controller_handle_total", 1u64, "outcome" => "error");
                warn!(controller = %self.name, key = %key, error = %e, "controller: handler failed");
                e
            }
        };

        match self.manager.retry(item, err).await {
            Ok(RetryOutcome::Requeued { attempt }) => {
                debug!(controller = %self.name, key = %key, attempt, "controller: requeued")
            }
            Ok(RetryOutcome::GaveUp(reason)) => {
                info!(controller = %self.name, key = %key, reason = %reason, "controller: dropped after give-up")
            }
            Ok(RetryOutcome::GiveUpFailed(reason)) => {
                debug!(controller = %self.name, key = %key, reason = %reason, "controller: requeued after failed give-up")
            }
            Err(e) => warn!(controller = %self.name, key = %key, error = %e, "controller: requeue failed"),
        }
    }
}
