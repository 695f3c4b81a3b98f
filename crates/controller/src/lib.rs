//! Kiln controller: pops work from a queue, runs a domain handler on it, and
//! requeues failures under a bounded, rate-limited retry policy.
//!
//! The moving parts are deliberately separate so tests can build each one in
//! isolation:
//! - [`Handler`]: the domain reconciliation step.
//! - [`RetryPolicy`]: when to stop retrying, and what to do on give-up.
//! - [`QueueRetryManager`]: per-key attempt tracking plus requeue.
//! - [`TokenBucket`]: shared limit on the global requeue rate.
//! - [`Plug`]: process-wide pause gate.
//! - [`RetryController`]: the worker loop tying them together.

#![forbid(unsafe_code)]

use std::future::Future;

use kiln_core::EnvError;

mod config;
mod controller;
mod guard;
mod limiter;
mod manager;
mod plug;
mod policy;

pub use config::ControllerConfig;
pub use controller::RetryController;
pub use guard::run_guarded;
pub use limiter::TokenBucket;
pub use manager::{QueueRetryManager, RetryManager, RetryOutcome};
pub use plug::Plug;
pub use policy::{
    give_up_fn, parse_bounds, Bound, Decision, GiveUp, GiveUpFn, GiveUpReason, Retry, RetryPolicy, RetryPolicyBuilder,
};

/// Why a single handler invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Failed(anyhow::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandleError {
    /// Collapse into the opaque domain error seen by retry policies.
    pub fn into_error(self) -> anyhow::Error {
        match self {
            HandleError::Failed(e) => e,
            HandleError::Panicked(msg) => anyhow::anyhow!("handler panicked: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("retry policy has no bound; configure a count, an elapsed window or never")]
    Unbounded,
    #[error("unknown retry bound kind: {0:?}")]
    UnknownBound(String),
    #[error("invalid retry bound {bound:?}: {reason}")]
    InvalidBound { bound: String, reason: String },
    #[error("invalid rate limit: qps={qps} burst={burst}")]
    InvalidRate { qps: f64, burst: u32 },
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Domain reconciliation step. Must be idempotent per key and must not block
/// forever; it runs on a shared worker.
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, item: T) -> anyhow::Result<()>;
}

/// [`Handler`] backed by an async closure; see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a [`Handler`].
pub fn handler_fn<T, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    FnHandler(f)
}

#[async_trait::async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, item: T) -> anyhow::Result<()> {
        (self.0)(item).await
    }
}
