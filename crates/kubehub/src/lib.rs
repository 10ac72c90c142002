//! Arbor kubehub – the remote client boundary and its kube-rs implementation.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use arbor_core::is_dry_run;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

/// Remote object store scoped to a single resource type.
///
/// Operators only reach the store through this trait, which keeps them testable
/// against in-memory fakes.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>>;

    /// List documents, optionally filtered by a label selector such as `ownerID=u1`.
    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<DynamicObject>>;

    /// Converge `obj` and return the server's view of it.
    async fn apply(&self, obj: &DynamicObject, dry_run: &[String]) -> Result<DynamicObject>;

    /// Delete by name. Returns `false` when the document was already absent.
    async fn delete(&self, name: &str, propagation: Option<PropagationPolicy>, dry_run: &[String]) -> Result<bool>;
}

fn field_manager() -> String {
    std::env::var("ARBOR_FIELD_MANAGER").unwrap_or_else(|_| "arbor".to_string())
}

/// `ResourceClient` backed by server-side apply on a dynamic API.
pub struct KubeClient {
    api: Api<DynamicObject>,
    field_manager: String,
}

impl KubeClient {
    pub fn new(api: Api<DynamicObject>) -> Self {
        Self { api, field_manager: field_manager() }
    }

    /// Resolve `gvk_key` through discovery and scope the API to `namespace` for namespaced kinds.
    pub async fn discover(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::default_namespaced_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        debug!(gvk = %gvk_key, ns = ?namespace, namespaced, "resource client ready");
        Ok(Self::new(api))
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        Ok(self.api.list(&lp).await?.items)
    }

    async fn apply(&self, obj: &DynamicObject, dry_run: &[String]) -> Result<DynamicObject> {
        let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
        let mut pp = PatchParams::apply(&self.field_manager).force();
        if is_dry_run(dry_run) {
            pp = pp.dry_run();
        }
        let body = strip_noisy(serde_json::to_value(obj).context("serializing object")?);
        match self.api.patch(&name, &pp, &Patch::Apply(&body)).await {
            Ok(o) => Ok(o),
            Err(e) => {
                counter!("kube_apply_err", 1u64);
                Err(anyhow!("server-side apply failed: {}", e))
            }
        }
    }

    async fn delete(&self, name: &str, propagation: Option<PropagationPolicy>, dry_run: &[String]) -> Result<bool> {
        let dp = DeleteParams { dry_run: is_dry_run(dry_run), propagation_policy: propagation, ..Default::default() };
        match self.api.delete(name, &dp).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(name = %name, "already absent");
                Ok(false)
            }
            Err(e) => {
                counter!("kube_delete_err", 1u64);
                Err(anyhow!("delete failed: {}", e))
            }
        }
    }
}

/// `v1/Kind` or `group/v1/Kind` key for a document, read from its type metadata.
pub fn gvk_key_of(obj: &DynamicObject) -> Result<String> {
    let types = obj.types.as_ref().ok_or_else(|| anyhow!("object missing apiVersion/kind"))?;
    if types.api_version.is_empty() {
        return Err(anyhow!("object missing apiVersion"));
    }
    if types.kind.is_empty() {
        return Err(anyhow!("object missing kind"));
    }
    Ok(format!("{}/{}", types.api_version, types.kind))
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
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

/// Drop server-populated fields that must not be sent in an apply patch.
fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}
