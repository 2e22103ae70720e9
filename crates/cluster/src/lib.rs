//! Cluster-facing collaborators: discovery, object cache, writer and
//! watch wiring over kube. Everything network-bound lives here so the
//! pipeline core never opens a connection.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vista_cache::ObjectCache;
use vista_controller::{Request, WriteMode, Writer};
use vista_core::{object, DeltaKind, Kind, ObjectKey};

fn relist_secs() -> u64 {
    std::env::var("VISTA_RELIST_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(300)
}

fn backoff_max_secs() -> u64 {
    std::env::var("VISTA_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30)
}

fn page_limit() -> u32 {
    std::env::var("VISTA_LIST_PAGE_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(500)
}

fn to_gvk(kind: &Kind) -> GroupVersionKind {
    GroupVersionKind {
        group: kind.group.clone(),
        version: kind.version.clone(),
        kind: kind.kind.clone(),
    }
}

// Discovery cache: kind key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

async fn find_api_resource(client: Client, kind: &Kind) -> Result<(ApiResource, bool)> {
    let key = kind.key();
    if let Some(hit) = DISCOVERY_CACHE.read().expect("discovery cache lock").get(&key).cloned() {
        return Ok(hit);
    }
    let gvk = to_gvk(kind);
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE
                    .write()
                    .expect("discovery cache lock")
                    .insert(key, (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("kind not served by the cluster: {}", kind))
}

fn api_for(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Result<Api<DynamicObject>> {
    if namespaced {
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(client, ns, ar)),
            None => Ok(Api::all_with(client, ar)),
        }
    } else {
        Ok(Api::all_with(client, ar))
    }
}

fn guard_not_view(kind: &Kind) -> Result<()> {
    if kind.is_view() {
        return Err(anyhow!("view kind {} is local to the runtime, not served by the cluster", kind));
    }
    Ok(())
}

/// Live-object read access backed by the cluster API.
#[derive(Clone)]
pub struct KubeCache {
    client: Client,
}

impl KubeCache {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await.context("building kube client")?))
    }
}

#[async_trait::async_trait]
impl ObjectCache for KubeCache {
    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Option<Value>, vista_cache::Error> {
        let fetch = async {
            guard_not_view(kind)?;
            let (ar, namespaced) = find_api_resource(self.client.clone(), kind).await?;
            let api = api_for(self.client.clone(), &ar, namespaced, key.namespace.as_deref())?;
            let obj = api.get_opt(&key.name).await.context("fetching object")?;
            match obj {
                Some(o) => Ok(Some(serde_json::to_value(&o).context("serializing object")?)),
                None => Ok::<_, anyhow::Error>(None),
            }
        };
        fetch.await.map_err(|e| vista_cache::Error::Internal(e.to_string()))
    }

    async fn list(&self, kind: &Kind) -> Result<Vec<Value>, vista_cache::Error> {
        let fetch = async {
            guard_not_view(kind)?;
            let (ar, namespaced) = find_api_resource(self.client.clone(), kind).await?;
            let api = api_for(self.client.clone(), &ar, namespaced, None)?;
            let mut out = Vec::new();
            let mut continue_token: Option<String> = None;
            loop {
                let mut params = ListParams::default();
                let limit = page_limit();
                if limit > 0 {
                    params = params.limit(limit);
                }
                if let Some(token) = &continue_token {
                    params = params.continue_token(token);
                }
                let list = api.list(&params).await.context("listing objects")?;
                for o in &list.items {
                    out.push(serde_json::to_value(o).context("serializing object")?);
                }
                continue_token = list.metadata.continue_.clone();
                if continue_token.is_none() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            Ok::<_, anyhow::Error>(out)
        };
        fetch.await.map_err(|e| vista_cache::Error::Internal(e.to_string()))
    }
}

/// Cluster writer: create-else-replace, merge-patch-else-create, and
/// delete tolerating an already-absent object. Idempotent under retry.
#[derive(Clone)]
pub struct KubeWriter {
    client: Client,
}

impl KubeWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await.context("building kube client")?))
    }
}

#[async_trait::async_trait]
impl Writer for KubeWriter {
    async fn apply(&self, kind: &Kind, obj: &Value, mode: WriteMode) -> Result<()> {
        guard_not_view(kind)?;
        let key = object::key(obj).context("projected object identity")?;
        let (ar, namespaced) = find_api_resource(self.client.clone(), kind).await?;
        if namespaced && key.namespace.is_none() {
            return Err(anyhow!("namespace required for namespaced kind {}", kind));
        }
        let api = api_for(self.client.clone(), &ar, namespaced, key.namespace.as_deref())?;

        match mode {
            WriteMode::Replace => {
                let mut desired = obj.clone();
                stamp_type_meta(&mut desired, kind);
                match api.get_opt(&key.name).await.context("fetching live object")? {
                    Some(live) => {
                        if let Some(rv) = live.metadata.resource_version {
                            desired["metadata"]["resourceVersion"] = Value::String(rv);
                        }
                        let dynamic: DynamicObject = serde_json::from_value(desired)
                            .context("shaping replacement object")?;
                        api.replace(&key.name, &PostParams::default(), &dynamic)
                            .await
                            .context("replacing object")?;
                    }
                    None => {
                        let dynamic: DynamicObject =
                            serde_json::from_value(desired).context("shaping new object")?;
                        api.create(&PostParams::default(), &dynamic)
                            .await
                            .context("creating object")?;
                    }
                }
            }
            WriteMode::Patch => {
                let mut desired = obj.clone();
                stamp_type_meta(&mut desired, kind);
                let res = api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&desired)).await;
                match res {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        let dynamic: DynamicObject =
                            serde_json::from_value(desired).context("shaping new object")?;
                        api.create(&PostParams::default(), &dynamic)
                            .await
                            .context("creating patched object")?;
                    }
                    Err(e) => return Err(e).context("patching object"),
                }
            }
            WriteMode::Delete => {
                match api.delete(&key.name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        debug!(kind = %kind, key = %key, "delete target already gone");
                    }
                    Err(e) => return Err(e).context("deleting object"),
                }
            }
        }
        counter!("target_writes_total", 1u64);
        Ok(())
    }
}

fn stamp_type_meta(obj: &mut Value, kind: &Kind) {
    if let Some(map) = obj.as_object_mut() {
        map.entry("apiVersion".to_string())
            .or_insert_with(|| Value::String(kind.api_version()));
        map.entry("kind".to_string()).or_insert_with(|| Value::String(kind.kind.clone()));
    }
}

fn request_from(kind: &Kind, obj: &DynamicObject, event: DeltaKind) -> Option<Request> {
    let name = obj.metadata.name.clone()?;
    Some(Request { kind: kind.clone(), namespace: obj.metadata.namespace.clone(), name, event })
}

/// Run a list+watch for one source kind, translating events into controller
/// requests. Sends block while the controller channel is full, which is the
/// backpressure path. Returns only when the channel closes.
pub async fn watch_source(
    client: Client,
    kind: Kind,
    namespace: Option<String>,
    request_tx: mpsc::Sender<Request>,
) -> Result<()> {
    guard_not_view(&kind)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &kind).await?;
    let relist = relist_secs();
    let backoff_max = backoff_max_secs();
    info!(kind = %kind, ns = ?namespace, relist_secs = relist, "watcher starting");

    let mut backoff: u64 = 1;
    loop {
        let api = api_for(client.clone(), &ar, namespaced, namespace.as_deref())?;
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);

        // jittered relist, ±10%
        let jitter = ((relist as f64) * 0.1) as i64;
        let jval = if jitter > 0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as i64;
            let sign = if (now & 1) == 0 { 1 } else { -1 };
            (now % (jitter + 1)) * sign
        } else {
            0
        };
        let relist_actual = (relist as i64 + jval).max(1) as u64;
        let relist_timer = tokio::time::sleep(std::time::Duration::from_secs(relist_actual));
        tokio::pin!(relist_timer);
        debug!(kind = %kind, relist_actual, "watch stream opened");

        let ended = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Applied(o))) => {
                            if let Some(req) = request_from(&kind, &o, DeltaKind::Updated) {
                                if request_tx.send(req).await.is_err() {
                                    info!(kind = %kind, "request channel closed; stopping watcher");
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Some(Event::Deleted(o))) => {
                            if let Some(req) = request_from(&kind, &o, DeltaKind::Deleted) {
                                if request_tx.send(req).await.is_err() {
                                    info!(kind = %kind, "request channel closed; stopping watcher");
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            debug!(kind = %kind, count = list.len(), "watch restart");
                            for o in &list {
                                if let Some(req) = request_from(&kind, o, DeltaKind::Sync) {
                                    if request_tx.send(req).await.is_err() {
                                        info!(kind = %kind, "request channel closed; stopping watcher");
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Ok(None) => break true,
                        Err(e) => {
                            warn!(kind = %kind, error = %e, "watch stream error; will backoff and restart");
                            counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = &mut relist_timer => {
                    debug!(kind = %kind, "periodic relist interval reached; restarting watch");
                    counter!("relist_total", 1u64);
                    break false;
                }
            }
        };

        if ended {
            let dur = std::time::Duration::from_secs(backoff.min(backoff_max));
            histogram!("watch_backoff_ms", dur.as_millis() as f64);
            tokio::time::sleep(dur).await;
            backoff = (backoff * 2).min(backoff_max).max(1);
        } else {
            backoff = 1;
        }
        counter!("watch_restarts_total", 1u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_mapping() {
        let kind = Kind::new("apps", "v1", "Deployment");
        let gvk = to_gvk(&kind);
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn view_kinds_are_guarded() {
        assert!(guard_not_view(&Kind::view("PodSummary")).is_err());
        assert!(guard_not_view(&Kind::core("v1", "Pod")).is_ok());
    }

    #[test]
    fn type_meta_is_stamped_not_overwritten() {
        let kind = Kind::new("apps", "v1", "Deployment");
        let mut obj = json!({"metadata": {"name": "d"}});
        stamp_type_meta(&mut obj, &kind);
        assert_eq!(obj["apiVersion"], "apps/v1");
        assert_eq!(obj["kind"], "Deployment");

        let mut keeps = json!({"apiVersion": "v2", "kind": "Other", "metadata": {"name": "d"}});
        stamp_type_meta(&mut keeps, &kind);
        assert_eq!(keeps["apiVersion"], "v2");
    }
}
