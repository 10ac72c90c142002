#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arbor_core::StatusEntry;
use arbor_kubehub::ResourceClient;
use arbor_ops::Callbacks;
use kube::{api::PropagationPolicy, core::DynamicObject};

/// In-memory store keyed by name, recording every call.
#[derive(Default)]
pub struct FakeClient {
    store: Mutex<BTreeMap<String, DynamicObject>>,
    calls: Mutex<Vec<String>>,
    fail_apply: Mutex<Option<String>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, obj: DynamicObject) {
        let name = obj.metadata.name.clone().unwrap();
        self.seed_under(&name, obj);
    }

    /// Store `obj` under `key` whatever its metadata says, e.g. a document without a name.
    pub fn seed_under(&self, key: &str, obj: DynamicObject) {
        self.store.lock().unwrap().insert(key.to_string(), obj);
    }

    pub fn fail_apply_of(&self, name: &str) {
        *self.fail_apply.lock().unwrap() = Some(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.store.lock().unwrap().keys().cloned().collect()
    }

    pub fn stored(&self, name: &str) -> Option<DynamicObject> {
        self.store.lock().unwrap().get(name).cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ResourceClient for FakeClient {
    async fn get(&self, name: &str) -> anyhow::Result<Option<DynamicObject>> {
        self.record(format!("get:{}", name));
        Ok(self.stored(name))
    }

    async fn list(&self, label_selector: Option<&str>) -> anyhow::Result<Vec<DynamicObject>> {
        self.record(format!("list:{}", label_selector.unwrap_or("")));
        let filter = label_selector.and_then(|s| s.split_once('='));
        let store = self.store.lock().unwrap();
        Ok(store
            .values()
            .filter(|o| match filter {
                Some((k, v)) => o.metadata.labels.as_ref().and_then(|l| l.get(k)).map(String::as_str) == Some(v),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn apply(&self, obj: &DynamicObject, _dry_run: &[String]) -> anyhow::Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.record(format!("apply:{}", name));
        if self.fail_apply.lock().unwrap().as_deref() == Some(name.as_str()) {
            anyhow::bail!("apply of {} rejected", name);
        }
        let mut out = obj.clone();
        out.metadata.uid.get_or_insert_with(|| format!("uid-{}", name));
        out.metadata.resource_version = Some("1".into());
        self.store.lock().unwrap().insert(name, out.clone());
        Ok(out)
    }

    async fn delete(&self, name: &str, _propagation: Option<PropagationPolicy>, _dry_run: &[String]) -> anyhow::Result<bool> {
        self.record(format!("delete:{}", name));
        Ok(self.store.lock().unwrap().remove(name).is_some())
    }
}

pub fn object(api_version: &str, kind: &str, name: &str, labels: &[(&str, &str)]) -> DynamicObject {
    let labels: BTreeMap<&str, &str> = labels.iter().copied().collect();
    serde_json::from_value(serde_json::json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "name": name, "labels": labels }
    }))
    .unwrap()
}

pub fn trigger(name: &str, labels: &[(&str, &str)]) -> DynamicObject {
    object("eventing.knative.dev/v1alpha1", "Trigger", name, labels)
}

/// Callbacks that log `pre:<name>` and `post:<status>:<name>` lines.
pub fn recording_callbacks() -> (Callbacks, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pre_log = log.clone();
    let post_log = log.clone();
    let cbs = Callbacks::new()
        .on_pre(move |o| {
            pre_log.lock().unwrap().push(format!("pre:{}", o.metadata.name.as_deref().unwrap_or("")));
            Ok(())
        })
        .on_post(move |e: &StatusEntry, _err| {
            post_log.lock().unwrap().push(format!("post:{}:{}", e.status, e.name));
            Ok(())
        });
    (cbs, log)
}
