use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::ConfigError;

/// Attempt bookkeeping for one key's current failure episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Requeues performed so far in this episode.
    pub count: u32,
    /// When the episode's first failure was recorded.
    pub started: Instant,
}

impl Retry {
    pub fn start() -> Self {
        Self { count: 0, started: Instant::now() }
    }
}

/// One stopping condition of a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum Bound {
    /// Give up once this many attempts have failed.
    Count(u32),
    /// Give up once the episode has lasted this long, whatever the count.
    Elapsed(Duration),
    /// Never requeue.
    Never,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Count(n) => write!(f, "count={n}"),
            Bound::Elapsed(d) => write!(f, "elapsed={}s", d.as_secs()),
            Bound::Never => f.write_str("never"),
        }
    }
}

impl From<Bound> for String {
    fn from(b: Bound) -> Self {
        b.to_string()
    }
}

impl FromStr for Bound {
    type Err = ConfigError;

    /// `count=<n>`, `elapsed=<n>s`, `elapsed=<n>m` or `never`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| ConfigError::InvalidBound { bound: s.to_string(), reason: reason.to_string() };
        let (kind, value) = match s.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (s, None),
        };
        match (kind, value) {
            ("never", None) => Ok(Bound::Never),
            ("never", Some(_)) => Err(invalid("never takes no value")),
            ("count", Some(v)) => match v.parse::<u32>() {
                Ok(0) => Err(invalid("count must be at least 1")),
                Ok(n) => Ok(Bound::Count(n)),
                Err(_) => Err(invalid("count is not a number")),
            },
            ("elapsed", Some(v)) => {
                let (digits, unit) = v.split_at(v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len()));
                let n: u64 = digits.parse().map_err(|_| invalid("elapsed is not a number"))?;
                let secs = match unit {
                    "s" | "" => n,
                    "m" => n.saturating_mul(60),
                    _ => return Err(invalid("elapsed unit must be s or m")),
                };
                if secs == 0 {
                    return Err(invalid("elapsed window must be positive"));
                }
                Ok(Bound::Elapsed(Duration::from_secs(secs)))
            }
            ("count" | "elapsed", None) => Err(invalid("missing value")),
            (other, _) => Err(ConfigError::UnknownBound(other.to_string())),
        }
    }
}

/// Parse a comma-separated bound list such as `count=60,elapsed=30m`.
pub fn parse_bounds(s: &str) -> Result<Vec<Bound>, ConfigError> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::parse).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUpReason {
    Fatal,
    Never,
    Attempts(u32),
    Elapsed(Duration),
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GiveUpReason::Fatal => f.write_str("fatal error"),
            GiveUpReason::Never => f.write_str("retries disabled"),
            GiveUpReason::Attempts(n) => write!(f, "{n} attempts failed"),
            GiveUpReason::Elapsed(d) => write!(f, "retrying for over {}s", d.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Retry,
    GiveUp(GiveUpReason),
}

type FatalFn = Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Terminal action for an item the policy stopped retrying, typically
/// recording a failure status on the object through the domain layer.
#[async_trait::async_trait]
pub trait GiveUp<T>: Send + Sync {
    /// An `Err` sends the item back through the queue; the action runs again
    /// the next time the policy gives up on it.
    async fn give_up(&self, item: &T, err: &anyhow::Error) -> anyhow::Result<()>;
}

/// [`GiveUp`] backed by a closure returning a future; see [`give_up_fn`].
pub struct GiveUpFn<F>(F);

/// Wrap `f` as a [`GiveUp`]. The returned future cannot borrow the
/// arguments; clone what it needs out of them first.
pub fn give_up_fn<T, F, Fut>(f: F) -> GiveUpFn<F>
where
    F: Fn(&T, &anyhow::Error) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    GiveUpFn(f)
}

#[async_trait::async_trait]
impl<T, F, Fut> GiveUp<T> for GiveUpFn<F>
where
    T: Send + Sync + 'static,
    F: Fn(&T, &anyhow::Error) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn give_up(&self, item: &T, err: &anyhow::Error) -> anyhow::Result<()> {
        (self.0)(item, err).await
    }
}

/// Bounded retry decision for failed items.
///
/// Always carries at least one [`Bound`]; a fatal classifier short-circuits
/// before any bound is consulted. The give-up action is the domain's hook
/// for recording a terminal failure; the policy never persists anything.
pub struct RetryPolicy<T> {
    bounds: Vec<Bound>,
    fatal: Option<FatalFn>,
    give_up: Option<Box<dyn GiveUp<T>>>,
}

impl<T> fmt::Debug for RetryPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("bounds", &self.bounds)
            .field("fatal", &self.fatal.is_some())
            .field("give_up", &self.give_up.is_some())
            .finish()
    }
}

impl<T> RetryPolicy<T> {
    pub fn builder() -> RetryPolicyBuilder<T> {
        RetryPolicyBuilder { bounds: Vec::new(), fatal: None, give_up: None }
    }

    pub fn bounds(&self) -> &[Bound] {
        &self.bounds
    }

    /// Decide the fate of an item whose attempt just failed with `err`;
    /// `retry` describes the episode before this failure is counted.
    pub fn decide(&self, err: &anyhow::Error, retry: &Retry) -> Decision {
        if self.fatal.as_ref().is_some_and(|is_fatal| is_fatal(err)) {
            return Decision::GiveUp(GiveUpReason::Fatal);
        }
        for bound in &self.bounds {
            match *bound {
                Bound::Never => return Decision::GiveUp(GiveUpReason::Never),
                Bound::Count(max) if retry.count.saturating_add(1) >= max => {
                    return Decision::GiveUp(GiveUpReason::Attempts(max));
                }
                Bound::Elapsed(window) if retry.started.elapsed() >= window => {
                    return Decision::GiveUp(GiveUpReason::Elapsed(window));
                }
                _ => {}
            }
        }
        Decision::Retry
    }

    /// Run the give-up action, if any.
    pub async fn give_up(&self, item: &T, err: &anyhow::Error) -> anyhow::Result<()> {
        match &self.give_up {
            Some(action) => action.give_up(item, err).await,
            None => Ok(()),
        }
    }
}

pub struct RetryPolicyBuilder<T> {
    bounds: Vec<Bound>,
    fatal: Option<FatalFn>,
    give_up: Option<Box<dyn GiveUp<T>>>,
}

impl<T> RetryPolicyBuilder<T> {
    pub fn max_attempts(self, n: u32) -> Self {
        self.bound(Bound::Count(n))
    }

    pub fn within(self, window: Duration) -> Self {
        self.bound(Bound::Elapsed(window))
    }

    pub fn never(self) -> Self {
        self.bound(Bound::Never)
    }

    pub fn bound(mut self, bound: Bound) -> Self {
        self.bounds.push(bound);
        self
    }

    pub fn bounds(mut self, bounds: impl IntoIterator<Item = Bound>) -> Self {
        self.bounds.extend(bounds);
        self
    }

    /// Errors for which `f` returns true are given up on at once.
    pub fn fatal(mut self, f: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static) -> Self {
        self.fatal = Some(Box::new(f));
        self
    }

    pub fn on_give_up(mut self, action: impl GiveUp<T> + 'static) -> Self {
        self.give_up = Some(Box::new(action));
        self
    }

    pub fn build(self) -> Result<RetryPolicy<T>, ConfigError> {
        if self.bounds.is_empty() {
            return Err(ConfigError::Unbounded);
        }
        for b in &self.bounds {
            match b {
                Bound::Count(0) => {
                    return Err(ConfigError::InvalidBound { bound: b.to_string(), reason: "count must be at least 1".into() })
                }
                Bound::Elapsed(d) if d.is_zero() => {
                    return Err(ConfigError::InvalidBound { bound: b.to_string(), reason: "elapsed window must be positive".into() })
                }
                _ => {}
            }
        }
        Ok(RetryPolicy { bounds: self.bounds, fatal: self.fatal, give_up: self.give_up })
    }
}
