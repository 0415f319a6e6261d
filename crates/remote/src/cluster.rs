//! Kube-backed Resource Service over `DynamicObject` + discovery.

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::prelude::*;

use crate::{CancelHandle, ResourceService, StreamHandle};

fn watch_channel_cap() -> usize {
    std::env::var("VIGIL_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
}

/// One shared client per process; kube clients are cheap to clone.
async fn shared_client() -> Result<Client> {
    static CLIENT: tokio::sync::OnceCell<Client> = tokio::sync::OnceCell::const_new();
    CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await
        .cloned()
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
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

fn to_uid(uid_str: &str) -> Result<Uid, ServiceError> {
    Uuid::parse_str(uid_str)
        .map(|u| *u.as_bytes())
        .map_err(|e| ServiceError::Invalid(format!("metadata.uid is not a uuid: {e}")))
}

fn pairs_to_map(pairs: &[(String, String)]) -> serde_json::Map<String, Json> {
    pairs
        .iter()
        .map(|(k, v)| (k.clone(), Json::String(v.clone())))
        .collect()
}

/// Decode a raw object (DynamicObject JSON) into a [`ProjectSnapshot`].
///
/// Malformed identity fields (missing name/uid, non-numeric
/// resourceVersion) are `Invalid`: retrying cannot fix them.
pub fn snapshot_from_json(raw: &Json) -> Result<ProjectSnapshot, ServiceError> {
    let meta = raw
        .get("metadata")
        .ok_or_else(|| ServiceError::Invalid("object missing metadata".into()))?;
    let name = meta
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServiceError::Invalid("object missing metadata.name".into()))?;
    let namespace = meta.get("namespace").and_then(|v| v.as_str());
    let key = match namespace {
        Some(ns) => ProjectKey::new(format!("{ns}/{name}")),
        None => ProjectKey::new(name),
    };
    let uid = to_uid(
        meta.get("uid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::Invalid("object missing metadata.uid".into()))?,
    )?;
    let revision = meta
        .get("resourceVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServiceError::Invalid("object missing metadata.resourceVersion".into()))?
        .parse::<u64>()
        .map_err(|e| ServiceError::Invalid(format!("non-numeric resourceVersion: {e}")))?;
    let phase = raw
        .get("status")
        .and_then(|s| s.get("phase"))
        .and_then(|v| v.as_str())
        .map(ProjectPhase::parse)
        .unwrap_or(ProjectPhase::Pending);
    let creation_ts = meta
        .get("creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);

    let mut labels = LabelPairs::new();
    let mut annotations = AnnotationPairs::new();
    if let Some(obj) = meta.get("labels").and_then(|m| m.as_object()) {
        for (k, v) in obj.iter() {
            if let Some(val) = v.as_str() {
                labels.push((k.clone(), val.to_string()));
            }
        }
    }
    if let Some(obj) = meta.get("annotations").and_then(|m| m.as_object()) {
        for (k, v) in obj.iter() {
            if let Some(val) = v.as_str() {
                annotations.push((k.clone(), val.to_string()));
            }
        }
    }

    Ok(ProjectSnapshot { key, uid, revision, phase, labels, annotations, creation_ts })
}

fn map_kube_err(e: kube::Error, key: Option<&ProjectKey>) -> ServiceError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => ServiceError::NotFound {
                key: key.cloned().unwrap_or_else(|| ProjectKey::new("")),
            },
            409 => ServiceError::Conflict(ae.message),
            400 | 422 => ServiceError::Invalid(ae.message),
            _ => ServiceError::Transient(ae.message),
        },
        other => ServiceError::Transient(other.to_string()),
    }
}

/// Resource Service backed by a live cluster, addressing one GVK.
pub struct KubeService {
    client: Client,
    ar: kube::core::ApiResource,
    namespaced: bool,
    gvk_key: String,
}

impl KubeService {
    /// Resolve the GVK via discovery and hold on to the shared client.
    pub async fn connect(gvk_key: &str) -> Result<Self> {
        let client = shared_client().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        info!(gvk = %gvk_key, namespaced, "resource service connected");
        Ok(Self { client, ar, namespaced, gvk_key: gvk_key.to_string() })
    }

    pub fn gvk_key(&self) -> &str {
        &self.gvk_key
    }

    /// `namespace/name` for namespaced kinds, plain `name` otherwise.
    fn split_key<'k>(&self, key: &'k ProjectKey) -> (Option<&'k str>, &'k str) {
        match key.as_str().split_once('/') {
            Some((ns, name)) if self.namespaced => (Some(ns), name),
            _ => (None, key.as_str()),
        }
    }

    fn api_all(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.ar)
    }

    fn api_for(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            None => Api::all_with(self.client.clone(), &self.ar),
        }
    }

    fn api_version(&self) -> String {
        if self.ar.group.is_empty() {
            self.ar.version.clone()
        } else {
            format!("{}/{}", self.ar.group, self.ar.version)
        }
    }

    fn decode(&self, obj: &DynamicObject) -> Result<ProjectSnapshot, ServiceError> {
        let raw = serde_json::to_value(obj)
            .map_err(|e| ServiceError::Invalid(format!("serializing object: {e}")))?;
        snapshot_from_json(&raw)
    }
}

#[async_trait::async_trait]
impl ResourceService for KubeService {
    async fn list(&self) -> Result<Vec<ProjectSnapshot>, ServiceError> {
        let objs = self
            .api_all()
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err(e, None))?;
        let mut out = Vec::with_capacity(objs.items.len());
        for obj in objs.items.iter() {
            match self.decode(obj) {
                Ok(s) => out.push(s),
                Err(e) => {
                    counter!("remote_decode_errors", 1u64);
                    warn!(error = %e, "skipping undecodable object in list");
                }
            }
        }
        Ok(out)
    }

    async fn get(&self, key: &ProjectKey) -> Result<ProjectSnapshot, ServiceError> {
        let (ns, name) = self.split_key(key);
        let obj = self
            .api_for(ns)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err(e, Some(key)))?
            .ok_or_else(|| ServiceError::NotFound { key: key.clone() })?;
        self.decode(&obj)
    }

    async fn watch(&self) -> Result<StreamHandle<RemoteEvent>, ServiceError> {
        let (tx, rx) = mpsc::channel::<RemoteEvent>(watch_channel_cap());
        let api = self.api_all();
        let gvk_key = self.gvk_key.clone();
        let task = tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default());
            futures::pin_mut!(stream);
            info!(gvk = %gvk_key, "watch stream opened");
            loop {
                let ev = match stream.try_next().await {
                    Ok(Some(ev)) => ev,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(gvk = %gvk_key, error = %e, "watch stream failed");
                        break;
                    }
                };
                let forwarded = match ev {
                    Event::Applied(o) => match serde_json::to_value(&o)
                        .ok()
                        .as_ref()
                        .map(snapshot_from_json)
                    {
                        Some(Ok(s)) => tx.send(RemoteEvent::Modified(s)).await.is_ok(),
                        _ => {
                            counter!("remote_decode_errors", 1u64);
                            true
                        }
                    },
                    Event::Deleted(o) => match serde_json::to_value(&o)
                        .ok()
                        .as_ref()
                        .map(snapshot_from_json)
                    {
                        Some(Ok(s)) => tx.send(RemoteEvent::Deleted(s)).await.is_ok(),
                        _ => {
                            counter!("remote_decode_errors", 1u64);
                            true
                        }
                    },
                    Event::Restarted(list) => {
                        debug!(count = list.len(), "watch restarted");
                        let mut ok = true;
                        for o in list.iter() {
                            match serde_json::to_value(o).ok().as_ref().map(snapshot_from_json) {
                                Some(Ok(s)) => {
                                    if tx.send(RemoteEvent::Added(s)).await.is_err() {
                                        ok = false;
                                        break;
                                    }
                                }
                                _ => counter!("remote_decode_errors", 1u64),
                            }
                        }
                        ok
                    }
                };
                if !forwarded {
                    break;
                }
            }
            debug!(gvk = %gvk_key, "watch task ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }

    async fn create(&self, snapshot: ProjectSnapshot) -> Result<ProjectSnapshot, ServiceError> {
        let (ns, name) = self.split_key(&snapshot.key);
        let mut metadata = serde_json::Map::new();
        metadata.insert("name".into(), Json::String(name.to_string()));
        if let Some(ns) = ns {
            metadata.insert("namespace".into(), Json::String(ns.to_string()));
        }
        if !snapshot.labels.is_empty() {
            metadata.insert("labels".into(), Json::Object(pairs_to_map(&snapshot.labels)));
        }
        if !snapshot.annotations.is_empty() {
            metadata.insert("annotations".into(), Json::Object(pairs_to_map(&snapshot.annotations)));
        }
        let raw = serde_json::json!({
            "apiVersion": self.api_version(),
            "kind": self.ar.kind,
            "metadata": metadata,
        });
        let obj: DynamicObject = serde_json::from_value(raw)
            .map_err(|e| ServiceError::Invalid(format!("building object: {e}")))?;
        let created = self
            .api_for(ns)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, Some(&snapshot.key)))?;
        self.decode(&created)
    }

    async fn update(&self, snapshot: ProjectSnapshot) -> Result<ProjectSnapshot, ServiceError> {
        let (ns, name) = self.split_key(&snapshot.key);
        // Carrying resourceVersion in the patch body makes the server reject
        // a stale write with 409 instead of silently overwriting.
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": snapshot.revision.to_string(),
                "labels": Json::Object(pairs_to_map(&snapshot.labels)),
                "annotations": Json::Object(pairs_to_map(&snapshot.annotations)),
            }
        });
        let obj = self
            .api_for(ns)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err(e, Some(&snapshot.key)))?;
        self.decode(&obj)
    }
}
