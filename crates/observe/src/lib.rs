//! Kiln observe: wait until a write is visible on enough backend replicas.
//!
//! After a write against a backend whose replicas are not linearizable, a
//! caller can block on [`ClusterObserver::observe_resource_version`] until a
//! quorum of replicas reports the written resource version, so later reads
//! against any of them see it.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kiln_core::{resource_version_of, split_meta_namespace_key, ResourceVersion, VersionError};
use kube::core::{ApiResource, DynamicObject};
use kube::{Api, Client};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    #[error("quorum {quorum} is not satisfiable with {views} backend views")]
    InvalidQuorum { quorum: usize, views: usize },
    #[error("invalid target version: {0}")]
    Version(#[from] VersionError),
    #[error("timed out waiting for version {target}: {observed} of {required} backends caught up")]
    Timeout { target: ResourceVersion, observed: usize, required: usize },
}

/// One replica's view of the backend.
#[async_trait::async_trait]
pub trait BackendView: Send + Sync {
    /// Label for logs.
    fn name(&self) -> &str;

    /// Resource version of `key` as currently visible at this replica.
    async fn current_version(&self, key: &str) -> anyhow::Result<ResourceVersion>;
}

/// Polls a set of [`BackendView`]s until a quorum has caught up to a version.
pub struct ClusterObserver {
    views: Vec<Arc<dyn BackendView>>,
    quorum: usize,
    poll_interval: Duration,
}

impl ClusterObserver {
    pub fn new(views: Vec<Arc<dyn BackendView>>, quorum: usize) -> Result<Self, ObserveError> {
        if quorum == 0 || quorum > views.len() {
            return Err(ObserveError::InvalidQuorum { quorum, views: views.len() });
        }
        Ok(Self { views, quorum, poll_interval: Duration::from_millis(100) })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Wait until at least `quorum` views report a version >= `target` for
    /// `key`. Returns as soon as the quorum is met; stragglers are abandoned.
    /// A timeout is reported but undoes nothing.
    pub async fn observe_resource_version(&self, key: &str, target: &str, timeout: Duration) -> Result<(), ObserveError> {
        let target: ResourceVersion = target.parse()?;
        let started = Instant::now();
        let mut polls = JoinSet::new();
        for view in &self.views {
            let view = Arc::clone(view);
            let key = key.to_string();
            let interval = self.poll_interval;
            polls.spawn(async move { wait_for_version(view, &key, target, interval).await });
        }

        let mut observed = 0usize;
        let reached = tokio::time::timeout(timeout, async {
            while let Some(joined) = polls.join_next().await {
                if joined.is_ok() {
                    observed += 1;
                    if observed >= self.quorum {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        // Dropping the set aborts polls that are still running.
        drop(polls);

        let waited_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("observe_wait_ms", waited_ms);
        if reached {
            debug!(key = %key, target = %target, observed, waited_ms, "observe: quorum reached");
            Ok(())
        } else {
            metrics::counter!("observe_timeouts_total", 1u64);
            warn!(key = %key, target = %target, observed, required = self.quorum, "observe: quorum not reached");
            Err(ObserveError::Timeout { target, observed, required: self.quorum })
        }
    }
}

async fn wait_for_version(view: Arc<dyn BackendView>, key: &str, target: ResourceVersion, interval: Duration) {
    loop {
        match view.current_version(key).await {
            Ok(rv) if rv >= target => return,
            Ok(rv) => debug!(view = view.name(), key = %key, rv = %rv, target = %target, "observe: behind"),
            Err(e) => debug!(view = view.name(), key = %key, error = %e, "observe: poll failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// [`BackendView`] reading one kind through one replica's kube client.
///
/// Keys are `namespace/name` or `name`. A namespaced kind is looked up in the
/// key's namespace, so the key must carry one; a cluster-scoped kind rejects
/// a key that does.
pub struct ApiView {
    name: String,
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl ApiView {
    pub fn new(name: impl Into<String>, client: Client, resource: ApiResource, namespaced: bool) -> Self {
        let name = name.into();
        info!(view = %name, kind = %resource.kind, namespaced, "observe: backend view registered");
        Self { name, client, resource, namespaced }
    }

    fn api_for<'k>(&self, key: &'k str) -> anyhow::Result<(Api<DynamicObject>, &'k str)> {
        let (ns, name) = split_meta_namespace_key(key)?;
        let api = match (self.namespaced, ns) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            (false, None) => Api::all_with(self.client.clone(), &self.resource),
            (true, None) => anyhow::bail!("key {key:?} has no namespace but {} is namespaced", self.resource.kind),
            (false, Some(_)) => anyhow::bail!("key {key:?} has a namespace but {} is cluster-scoped", self.resource.kind),
        };
        Ok((api, name))
    }
}

#[async_trait::async_trait]
impl BackendView for ApiView {
    fn name(&self) -> &str {
        &self.name
    }

    async fn current_version(&self, key: &str) -> anyhow::Result<ResourceVersion> {
        let (api, name) = self.api_for(key)?;
        match api.get_opt(name).await? {
            Some(obj) => Ok(resource_version_of(&obj)?),
            // Not visible yet at this replica.
            None => Ok(ResourceVersion(0)),
        }
    }
}
