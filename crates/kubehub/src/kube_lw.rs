use anyhow::{anyhow, Result};
use futures::StreamExt;
use kiln_core::Object;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{ListPage, ListWatcher, WatchError, WatchEvent, WatchStream};

/// Server-side watch timeout; must stay below the apiserver's 295s cap.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// [`ListWatcher`] over a kube [`Api`], optionally narrowed by selectors.
#[derive(Clone)]
pub struct KubeListWatcher<K> {
    api: Api<K>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    strip_managed_fields: bool,
}

impl<K> KubeListWatcher<K>
where
    K: Object + DeserializeOwned,
{
    pub fn new(api: Api<K>) -> Self {
        Self { api, label_selector: None, field_selector: None, strip_managed_fields: true }
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    /// Keep `metadata.managedFields` on reflected objects (dropped by default).
    pub fn keep_managed_fields(mut self) -> Self {
        self.strip_managed_fields = false;
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = &self.label_selector {
            lp = lp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            lp = lp.fields(f);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(l) = &self.label_selector {
            wp = wp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            wp = wp.fields(f);
        }
        wp
    }
}

fn shape<K: Object>(mut obj: K, strip: bool) -> K {
    if strip {
        obj.meta_mut().managed_fields = None;
    }
    obj
}

#[async_trait::async_trait]
impl<K> ListWatcher for KubeListWatcher<K>
where
    K: Object + DeserializeOwned,
{
    type Object = K;

    async fn list(&self) -> Result<ListPage<K>, WatchError> {
        let list = self.api.list(&self.list_params()).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        let strip = self.strip_managed_fields;
        let items = list.items.into_iter().map(|o| shape(o, strip)).collect();
        Ok(ListPage { items, resource_version })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, WatchError> {
        let stream = self.api.watch(&self.watch_params(), resource_version).await?;
        let strip = self.strip_managed_fields;
        Ok(stream
            .map(move |ev| match ev {
                Ok(kube::api::WatchEvent::Added(o)) => Ok(WatchEvent::Added(shape(o, strip))),
                Ok(kube::api::WatchEvent::Modified(o)) => Ok(WatchEvent::Modified(shape(o, strip))),
                Ok(kube::api::WatchEvent::Deleted(o)) => Ok(WatchEvent::Deleted(shape(o, strip))),
                Ok(kube::api::WatchEvent::Bookmark(bm)) => Ok(WatchEvent::Bookmark(bm.metadata.resource_version)),
                Ok(kube::api::WatchEvent::Error(e)) => Ok(WatchEvent::Error { code: e.code, message: e.message }),
                Err(e) => Err(WatchError::Kube(e)),
            })
            .boxed())
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK key through discovery into its resource and whether it is namespaced.
pub async fn discover_gvk(client: Client, gvk_key: &str) -> Result<(ApiResource, bool)> {
    let gvk = parse_gvk_key(gvk_key)?;
    find_api_resource(client, &gvk).await
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Resolve a GVK key through discovery and build a dynamic list-watcher for it,
/// scoped to `namespace` when the kind is namespaced.
pub async fn dynamic_list_watcher(
    client: Client,
    gvk_key: &str,
    namespace: Option<&str>,
) -> Result<KubeListWatcher<DynamicObject>> {
    let (ar, namespaced) = discover_gvk(client.clone(), gvk_key).await?;
    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        (false, Some(ns)) => {
            debug!(gvk = %gvk_key, ns = %ns, "kind is cluster-scoped; ignoring namespace");
            Api::all_with(client, &ar)
        }
        (_, None) => Api::all_with(client, &ar),
    };
    info!(gvk = %gvk_key, ns = ?namespace, namespaced, "list-watcher resolved");
    Ok(KubeListWatcher::new(api))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_parse_with_and_without_group() {
        let core = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Pod"));
        let grouped = parse_gvk_key("build.openshift.io/v1/Build").unwrap();
        assert_eq!(grouped.group, "build.openshift.io");
        assert!(parse_gvk_key("Pod").is_err());
    }
}
