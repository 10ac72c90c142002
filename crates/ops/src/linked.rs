//! Linked-items operator: a group of documents (event triggers and the like) that
//! all carry a tracking label with their owner's uid, so the group can be diffed
//! on later applies.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_core::{Error, Result};
use arbor_kubehub::ResourceClient;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::PropagationPolicy, core::DynamicObject};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{apply_items, cancellable, delete_items, delete_object, fire_post, fire_pre, ApplyOptions, DeleteOptions, Operator, Options};

/// Label carrying the owner's uid on every managed item.
pub const OWNER_ID_LABEL: &str = "ownerID";

pub const DEFAULT_OWNER_KIND: &str = "Function";

pub struct LinkedItemsOperator {
    client: Arc<dyn ResourceClient>,
    items: Vec<DynamicObject>,
    owner_kind: String,
}

impl LinkedItemsOperator {
    pub fn new(client: Arc<dyn ResourceClient>, items: Vec<DynamicObject>) -> Self {
        Self { client, items, owner_kind: DEFAULT_OWNER_KIND.to_string() }
    }

    pub fn with_owner_kind(mut self, kind: impl Into<String>) -> Self {
        self.owner_kind = kind.into();
        self
    }

    pub fn items(&self) -> &[DynamicObject] {
        &self.items
    }

    /// Delete previously labeled items that are no longer desired.
    async fn wipe_removed(&self, ctx: &CancellationToken, owner_id: &str, opts: &Options) -> Result<()> {
        let selector = format!("{}={}", OWNER_ID_LABEL, owner_id);
        let listed = cancellable(ctx, self.client.list(Some(&selector))).await?;
        let stale_items = listed.iter().filter(|u| u.metadata.name.as_deref().is_some_and(|n| !self.contains(n)));
        for stale in stale_items {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            fire_pre(stale, &opts.callbacks.pre)?;
            let (entry, outcome) =
                delete_object(ctx, self.client.as_ref(), stale, Some(PropagationPolicy::Foreground), &opts.dry_run).await;
            fire_post(&entry, outcome, &opts.callbacks.post)?;
            info!(item = %entry.name, owner = %owner_id, "removed item no longer desired");
            counter!("ops_items_wiped_total", 1u64);
        }
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|u| u.metadata.name.as_deref() == Some(name))
    }
}

#[async_trait::async_trait]
impl Operator for LinkedItemsOperator {
    async fn apply(&mut self, ctx: &CancellationToken, opts: &ApplyOptions) -> Result<()> {
        let owner_id = find_owner_id(&opts.owner_references, &self.owner_kind)
            .ok_or_else(|| Error::NotFound(format!("{}: no {} owner reference", OWNER_ID_LABEL, self.owner_kind)))?;
        debug!(owner = %owner_id, items = self.items.len(), "applying linked items");
        self.wipe_removed(ctx, &owner_id, &opts.options).await?;

        let refs = &opts.owner_references;
        let tracking = BTreeMap::from([(OWNER_ID_LABEL.to_string(), owner_id.clone())]);
        apply_items(ctx, self.client.as_ref(), &mut self.items, &opts.options, |item| {
            item.metadata.owner_references = Some(refs.clone());
            merge_labels(item.metadata.labels.get_or_insert_with(BTreeMap::new), &tracking);
        })
        .await
    }

    async fn delete(&mut self, ctx: &CancellationToken, opts: &DeleteOptions) -> Result<()> {
        delete_items(ctx, self.client.as_ref(), &self.items, opts).await
    }
}

/// Uid of the first reference of `kind`.
fn find_owner_id(refs: &[OwnerReference], kind: &str) -> Option<String> {
    refs.iter().find(|r| r.kind == kind).map(|r| r.uid.clone())
}

/// Desired labels overwrite same-key labels; all others are kept.
fn merge_labels(labels: &mut BTreeMap<String, String>, desired: &BTreeMap<String, String>) {
    for (k, v) in desired {
        labels.insert(k.clone(), v.clone());
    }
}
