use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use kiln_cache::Store;
use kiln_core::{env_or, resource_version_of, EnvError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ListWatcher, WatchError, WatchEvent};

/// Reflector timing knobs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReflectorConfig {
    /// Force a full relist this often even if the watch is healthy. Zero disables.
    pub resync_period: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(120),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl ReflectorConfig {
    /// Defaults overridden by `KILN_RESYNC_SECS`, `KILN_WATCH_BACKOFF_INITIAL_MS`
    /// and `KILN_WATCH_BACKOFF_MAX_SECS`. A set but malformed variable is an error.
    pub fn from_env() -> Result<Self, EnvError> {
        let d = Self::default();
        let resync_period = Duration::from_secs(env_or("KILN_RESYNC_SECS", d.resync_period.as_secs())?);
        let backoff_initial = Duration::from_millis(env_or(
            "KILN_WATCH_BACKOFF_INITIAL_MS",
            d.backoff_initial.as_millis() as u64,
        )?);
        let backoff_max = Duration::from_secs(env_or("KILN_WATCH_BACKOFF_MAX_SECS", d.backoff_max.as_secs())?);
        Ok(Self { resync_period, backoff_initial, backoff_max: backoff_max.max(backoff_initial) })
    }
}

/// Doubling delay between relists, capped; reset once a watch proves healthy.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: None }
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(d) => d.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Why a list+watch cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchExit {
    Stopped,
    /// Resync period elapsed; relist now.
    Resync,
    /// Cursor fell out of the watch window; relist now.
    Expired,
    /// Backend closed the stream; relist after backoff.
    Closed,
}

/// Mirrors a remote collection into a [`Store`] via list + watch.
///
/// Every cycle starts with a full list (`Store::replace`) and then replays the
/// watch stream from the list's resource version. Any stream termination goes
/// back to a full list, since events missed while disconnected cannot be
/// recovered otherwise.
pub struct Reflector<L: ListWatcher> {
    name: String,
    lw: L,
    store: Arc<dyn Store<L::Object>>,
    config: ReflectorConfig,
    last_sync: Mutex<String>,
}

impl<L: ListWatcher + 'static> Reflector<L> {
    pub fn new(name: impl Into<String>, lw: L, store: Arc<dyn Store<L::Object>>, resync_period: Duration) -> Self {
        let config = ReflectorConfig { resync_period, ..ReflectorConfig::default() };
        Self::with_config(name, lw, store, config)
    }

    pub fn with_config(name: impl Into<String>, lw: L, store: Arc<dyn Store<L::Object>>, config: ReflectorConfig) -> Self {
        Self { name: name.into(), lw, store, config, last_sync: Mutex::new(String::new()) }
    }

    /// Resource version of the last list or watch event applied to the store.
    pub fn last_sync_resource_version(&self) -> String {
        self.last_sync.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_last_sync(&self, rv: &str) {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = rv.to_string();
    }

    /// Run on a background task until `stop` fires.
    pub fn spawn(self: Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(stop).await })
    }

    /// List, watch, relist; forever until `stop` fires. Backend failures are
    /// logged and retried with backoff, never returned.
    pub async fn run(&self, stop: CancellationToken) {
        info!(reflector = %self.name, resync_secs = self.config.resync_period.as_secs(), "reflector: started");
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        loop {
            let exit = self.list_and_watch(&stop, &mut backoff).await;
            let delay = match exit {
                Ok(WatchExit::Stopped) => break,
                Ok(WatchExit::Resync) => {
                    debug!(reflector = %self.name, "reflector: resync period elapsed; relisting");
                    backoff.reset();
                    continue;
                }
                Ok(WatchExit::Expired) => {
                    info!(reflector = %self.name, rv = %self.last_sync_resource_version(), "reflector: watch cursor expired; relisting");
                    Duration::ZERO
                }
                Ok(WatchExit::Closed) => {
                    debug!(reflector = %self.name, "reflector: watch closed by backend");
                    backoff.next_delay()
                }
                Err(e) => {
                    warn!(reflector = %self.name, error = %e, "reflector: list/watch failed");
                    backoff.next_delay()
                }
            };
            metrics::counter!("reflector_watch_restarts_total", 1u64, "reflector" => self.name.clone());
            if stop.is_cancelled() {
                break;
            }
            if !delay.is_zero() {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        info!(reflector = %self.name, "reflector: stopped");
    }

    async fn list_and_watch(&self, stop: &CancellationToken, backoff: &mut Backoff) -> Result<WatchExit, WatchError> {
        let page = tokio::select! {
            _ = stop.cancelled() => return Ok(WatchExit::Stopped),
            r = self.lw.list() => r?,
        };
        if page.resource_version.is_empty() {
            return Err(WatchError::Malformed("list returned no resourceVersion".into()));
        }
        let count = page.items.len();
        let mut cursor = page.resource_version;
        self.store.replace(page.items, &cursor)?;
        self.set_last_sync(&cursor);
        metrics::counter!("reflector_list_total", 1u64, "reflector" => self.name.clone());
        info!(reflector = %self.name, count, rv = %cursor, "reflector: listed");

        let period = self.config.resync_period;
        let resync = async move {
            if period.is_zero() {
                futures::future::pending::<()>().await
            } else {
                tokio::time::sleep(period).await
            }
        };
        tokio::pin!(resync);

        let mut stream = tokio::select! {
            _ = stop.cancelled() => return Ok(WatchExit::Stopped),
            r = self.lw.watch(&cursor) => r?,
        };
        debug!(reflector = %self.name, rv = %cursor, "reflector: watching");
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => return Ok(WatchExit::Stopped),
                _ = &mut resync => return Ok(WatchExit::Resync),
                ev = stream.next() => ev,
            };
            match next {
                None => return Ok(WatchExit::Closed),
                Some(Err(e)) => return Err(e),
                Some(Ok(ev)) => {
                    if let Some(exit) = self.apply(ev, &mut cursor)? {
                        return Ok(exit);
                    }
                    backoff.reset();
                }
            }
        }
    }

    /// Translate one watch event into a store write and advance the cursor.
    fn apply(&self, ev: WatchEvent<L::Object>, cursor: &mut String) -> Result<Option<WatchExit>, WatchError> {
        let (kind, rv) = match ev {
            WatchEvent::Added(obj) => {
                let rv = resource_version_of(&obj)?;
                self.store.add(obj)?;
                ("added", rv.to_string())
            }
            WatchEvent::Modified(obj) => {
                let rv = resource_version_of(&obj)?;
                self.store.update(obj)?;
                ("modified", rv.to_string())
            }
            WatchEvent::Deleted(obj) => {
                let rv = resource_version_of(&obj)?;
                self.store.delete(obj)?;
                ("deleted", rv.to_string())
            }
            WatchEvent::Bookmark(rv) => ("bookmark", rv),
            WatchEvent::Error { code: 410, message } => {
                debug!(reflector = %self.name, message = %message, "reflector: watch returned 410");
                return Ok(Some(WatchExit::Expired));
            }
            WatchEvent::Error { code, message } => return Err(WatchError::Api { code, message }),
        };
        metrics::counter!("reflector_watch_events_total", 1u64, "type" => kind);
        debug!(reflector = %self.name, event = kind, rv = %rv, "reflector: event");
        *cursor = rv;
        self.set_last_sync(cursor);
        Ok(None)
    }
}
