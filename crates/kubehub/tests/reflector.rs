#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_cache::{DeltaFifo, Queue, Store};
use kiln_core::{DeltaType, Deltas};
use kiln_kubehub::{ListPage, ListWatcher, Reflector, ReflectorConfig, WatchError, WatchEvent, WatchStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn cm(name: &str, rv: u64) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("ns".to_string()),
            resource_version: Some(rv.to_string()),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    }
}

fn page(items: Vec<ConfigMap>, rv: &str) -> Result<ListPage<ConfigMap>, WatchError> {
    Ok(ListPage { items, resource_version: rv.to_string() })
}

type Events = Vec<Result<WatchEvent<ConfigMap>, WatchError>>;

/// Plays back scripted list results and watch sessions. Once the list script
/// runs out the call parks forever, like an idle backend; once the watch
/// script runs out every watch stays open and silent.
#[derive(Default)]
struct Script {
    lists: Mutex<VecDeque<Result<ListPage<ConfigMap>, WatchError>>>,
    /// (events, keep the stream open afterwards)
    watches: Mutex<VecDeque<(Events, bool)>>,
    list_calls: AtomicUsize,
    watch_from: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
struct ScriptedLw(Arc<Script>);

impl ScriptedLw {
    fn then_list(self, r: Result<ListPage<ConfigMap>, WatchError>) -> Self {
        self.0.lists.lock().unwrap().push_back(r);
        self
    }

    fn then_watch(self, events: Events, keep_open: bool) -> Self {
        self.0.watches.lock().unwrap().push_back((events, keep_open));
        self
    }

    fn list_calls(&self) -> usize {
        self.0.list_calls.load(Ordering::SeqCst)
    }

    fn watched_from(&self) -> Vec<String> {
        self.0.watch_from.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ListWatcher for ScriptedLw {
    type Object = ConfigMap;

    async fn list(&self) -> Result<ListPage<ConfigMap>, WatchError> {
        self.0.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.0.lists.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<ConfigMap>, WatchError> {
        self.0.watch_from.lock().unwrap().push(resource_version.to_string());
        let next = self.0.watches.lock().unwrap().pop_front();
        let (events, keep_open) = next.unwrap_or((Vec::new(), true));
        let head = futures::stream::iter(events);
        if keep_open {
            Ok(head.chain(futures::stream::pending()).boxed())
        } else {
            Ok(head.boxed())
        }
    }
}

fn fast() -> ReflectorConfig {
    ReflectorConfig {
        resync_period: Duration::ZERO,
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
    }
}

fn start<S: Store<ConfigMap> + 'static>(
    lw: &ScriptedLw,
    store: Arc<S>,
    config: ReflectorConfig,
) -> (Arc<Reflector<ScriptedLw>>, CancellationToken, JoinHandle<()>) {
    let store: Arc<dyn Store<ConfigMap>> = store;
    let reflector = Arc::new(Reflector::with_config("configmaps", lw.clone(), store, config));
    let stop = CancellationToken::new();
    let task = reflector.clone().spawn(stop.clone());
    (reflector, stop, task)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn shape(ds: &Deltas<ConfigMap>) -> Vec<(DeltaType, String)> {
    ds.iter()
        .map(|d| {
            let rv = d.object.object().and_then(|o| o.metadata.resource_version.clone()).unwrap_or_default();
            (d.kind, rv)
        })
        .collect()
}

#[tokio::test]
async fn initial_list_then_watch_yields_ordered_history() {
    let lw = ScriptedLw::default()
        .then_list(page(vec![cm("a", 1)], "1"))
        .then_watch(vec![Ok(WatchEvent::Modified(cm("a", 2))), Ok(WatchEvent::Deleted(cm("a", 3)))], true);
    let q = Arc::new(DeltaFifo::<ConfigMap>::new());
    let (reflector, stop, task) = start(&lw, q.clone(), fast());

    eventually(|| reflector.last_sync_resource_version() == "3").await;
    let ds = q.pop().await.unwrap();
    assert_eq!(
        shape(&ds),
        vec![
            (DeltaType::Sync, "1".into()),
            (DeltaType::Updated, "2".into()),
            (DeltaType::Deleted, "3".into()),
        ]
    );
    assert_eq!(lw.watched_from(), vec!["1".to_string()]);

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn watch_loss_forces_relist_that_recovers_missed_deletion() {
    let lw = ScriptedLw::default()
        .then_list(page(vec![cm("a", 1), cm("b", 1)], "1"))
        .then_watch(Vec::new(), false)
        .then_list(page(vec![cm("a", 1)], "5"))
        .then_watch(Vec::new(), true);
    let q = Arc::new(DeltaFifo::<ConfigMap>::new());
    let (reflector, stop, task) = start(&lw, q.clone(), fast());

    eventually(|| reflector.last_sync_resource_version() == "5").await;
    let a = q.pop().await.unwrap();
    assert_eq!(q.key_of(&a).unwrap(), "ns/a");
    let b = q.pop().await.unwrap();
    assert_eq!(q.key_of(&b).unwrap(), "ns/b");
    let last = b.newest().unwrap();
    assert_eq!(last.kind, DeltaType::Deleted);
    assert!(last.object.is_tombstone());
    assert_eq!(lw.watched_from(), vec!["1".to_string(), "5".to_string()]);

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn expired_cursor_relists_without_backoff() {
    let lw = ScriptedLw::default()
        .then_list(page(vec![cm("a", 1)], "1"))
        .then_watch(vec![Ok(WatchEvent::Error { code: 410, message: "too old".into() })], true)
        .then_list(page(vec![cm("a", 9)], "9"));
    let q = Arc::new(DeltaFifo::<ConfigMap>::new());
    let config = ReflectorConfig { backoff_initial: Duration::from_secs(3600), backoff_max: Duration::from_secs(3600), ..fast() };
    let (reflector, stop, task) = start(&lw, q.clone(), config);

    eventually(|| lw.list_calls() >= 2).await;
    eventually(|| reflector.last_sync_resource_version() == "9").await;

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn failed_list_is_retried() {
    let lw = ScriptedLw::default()
        .then_list(Err(WatchError::Api { code: 500, message: "etcd unavailable".into() }))
        .then_list(page(vec![cm("a", 4)], "4"))
        .then_watch(Vec::new(), true);
    let q = Arc::new(DeltaFifo::<ConfigMap>::new());
    let (_reflector, stop, task) = start(&lw, q.clone(), fast());

    eventually(|| q.len() == 1).await;
    assert_eq!(lw.list_calls(), 2);
    assert_eq!(q.get_by_key("ns/a").and_then(|o| o.metadata.resource_version), Some("4".to_string()));

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn object_without_version_forces_relist() {
    let mut broken = cm("x", 0);
    broken.metadata.resource_version = None;
    let lw = ScriptedLw::default()
        .then_list(page(Vec::new(), "1"))
        .then_watch(vec![Ok(WatchEvent::Added(broken))], true)
        .then_list(page(vec![cm("x", 2)], "2"))
        .then_watch(Vec::new(), true);
    let q = Arc::new(DeltaFifo::<ConfigMap>::new());
    let (reflector, stop, task) = start(&lw, q.clone(), fast());

    eventually(|| reflector.last_sync_resource_version() == "2").await;
    assert_eq!(lw.list_calls(), 2);

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn resync_period_triggers_periodic_relist() {
    let lw = ScriptedLw::default()
        .then_list(page(vec![cm("a", 1)], "1"))
        .then_watch(Vec::new(), true)
        .then_list(page(vec![cm("a", 1)], "1"))
        .then_watch(Vec::new(), true);
    let q = Arc::new(DeltaFifo::<ConfigMap>::new());
    let config = ReflectorConfig { resync_period: Duration::from_millis(30), ..fast() };
    let (_reflector, stop, task) = start(&lw, q.clone(), config);

    eventually(|| lw.list_calls() >= 2).await;
    let ds = q.pop().await.unwrap();
    assert_eq!(shape(&ds), vec![(DeltaType::Sync, "1".into()), (DeltaType::Sync, "1".into())]);

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn fifo_target_keeps_only_latest_value() {
    let lw = ScriptedLw::default()
        .then_list(page(vec![cm("a", 1)], "1"))
        .then_watch(vec![Ok(WatchEvent::Modified(cm("a", 2))), Ok(WatchEvent::Bookmark("6".into()))], true);
    let q = Arc::new(kiln_cache::Fifo::<ConfigMap>::new());
    let (reflector, stop, task) = start(&lw, q.clone(), fast());

    eventually(|| reflector.last_sync_resource_version() == "6").await;
    assert_eq!(q.len(), 1);
    let obj = q.pop().await.unwrap();
    assert_eq!(obj.metadata.resource_version.as_deref(), Some("2"));

    stop.cancel();
    task.await.unwrap();
}
