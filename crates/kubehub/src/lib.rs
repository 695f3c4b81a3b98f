//! Kiln kubehub: the list-watch contract, the reflector that mirrors a remote
//! collection into a local store, and kube-backed list-watchers.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use kiln_cache::StoreError;
use kiln_core::{Object, VersionError};

mod kube_lw;
mod reflector;

pub use kube_lw::{discover_gvk, dynamic_list_watcher, parse_gvk_key, KubeListWatcher};
pub use reflector::{Reflector, ReflectorConfig};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("backend error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<VersionError> for WatchError {
    fn from(e: VersionError) -> Self {
        WatchError::Malformed(e.to_string())
    }
}

/// Snapshot returned by a list call: every object plus the version it was taken at.
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// One change observed on a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: advances the cursor without a change.
    Bookmark(String),
    /// In-band backend error; 410 means the cursor expired.
    Error { code: u16, message: String },
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, WatchError>>;

/// List + watch capability for one resource kind.
///
/// The stream returned by `watch` ends (or yields an error) whenever the
/// backend drops the connection; the reflector then relists.
#[async_trait::async_trait]
pub trait ListWatcher: Send + Sync {
    type Object: Object;

    async fn list(&self) -> Result<ListPage<Self::Object>, WatchError>;

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Self::Object>, WatchError>;
}
