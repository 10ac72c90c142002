//! Arbor Ops: operators converge or tear down one logical unit of remote state.
//! Side effects are reported through the callback chain; each call returns a
//! single terminal error.

#![forbid(unsafe_code)]

use std::future::Future;

use arbor_core::{Error, Result, StatusEntry, StatusKind};
use arbor_kubehub::ResourceClient;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::PropagationPolicy, core::DynamicObject};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod callbacks;
mod generic;
mod linked;

pub use callbacks::{fire_post, fire_pre, Callbacks, PostCallback, PreCallback};
pub use generic::GenericOperator;
pub use linked::{LinkedItemsOperator, DEFAULT_OWNER_KIND, OWNER_ID_LABEL};

/// Settings shared by apply and delete.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Empty, or a single `All` marker for validation-only runs
    pub dry_run: Vec<String>,
    pub callbacks: Callbacks,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Inherited from the parent's successful apply; empty for top-level parents
    pub owner_references: Vec<OwnerReference>,
    pub options: Options,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub propagation: Option<PropagationPolicy>,
    pub options: Options,
}

#[async_trait::async_trait]
pub trait Operator: Send + Sync {
    /// Converge the managed items. Re-applying a converged operator is a no-op.
    async fn apply(&mut self, ctx: &CancellationToken, opts: &ApplyOptions) -> Result<()>;

    /// Remove the managed items. Items already absent are not an error.
    async fn delete(&mut self, ctx: &CancellationToken, opts: &DeleteOptions) -> Result<()>;
}

/// Race a remote call against cancellation.
async fn cancellable<T, F>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        r = fut => r.map_err(Error::Remote),
    }
}

pub(crate) async fn apply_object(
    ctx: &CancellationToken,
    client: &dyn ResourceClient,
    obj: &DynamicObject,
    dry_run: &[String],
) -> (StatusEntry, Result<DynamicObject>) {
    match cancellable(ctx, client.apply(obj, dry_run)).await {
        Ok(mut applied) => {
            if applied.types.is_none() {
                applied.types = obj.types.clone();
            }
            (StatusEntry::from_object(StatusKind::Applied, &applied), Ok(applied))
        }
        Err(e) => (StatusEntry::from_object(StatusKind::ApplyFailed, obj), Err(e)),
    }
}

pub(crate) async fn delete_object(
    ctx: &CancellationToken,
    client: &dyn ResourceClient,
    obj: &DynamicObject,
    propagation: Option<PropagationPolicy>,
    dry_run: &[String],
) -> (StatusEntry, Result<()>) {
    let name = obj.metadata.name.clone().unwrap_or_default();
    match cancellable(ctx, client.delete(&name, propagation, dry_run)).await {
        Ok(existed) => {
            debug!(name = %name, existed, "item deleted");
            counter!("ops_items_deleted_total", 1u64);
            (StatusEntry::from_object(StatusKind::Deleted, obj), Ok(()))
        }
        Err(e) => (StatusEntry::from_object(StatusKind::DeleteFailed, obj), Err(e)),
    }
}

/// Apply `items` one at a time, stamping each before the pre callbacks fire and
/// replacing it with the server's copy afterwards.
pub(crate) async fn apply_items<F>(
    ctx: &CancellationToken,
    client: &dyn ResourceClient,
    items: &mut [DynamicObject],
    opts: &Options,
    stamp: F,
) -> Result<()>
where
    F: Fn(&mut DynamicObject) + Send,
{
    for item in items.iter_mut() {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        stamp(item);
        fire_pre(item, &opts.callbacks.pre)?;
        let (entry, res) = apply_object(ctx, client, item, &opts.dry_run).await;
        let (applied, outcome) = match res {
            Ok(o) => (Some(o), Ok(())),
            Err(e) => (None, Err(e)),
        };
        fire_post(&entry, outcome, &opts.callbacks.post)?;
        if let Some(o) = applied {
            debug!(item = %entry, "item applied");
            counter!("ops_items_applied_total", 1u64);
            *item = o;
        }
    }
    Ok(())
}

pub(crate) async fn delete_items(
    ctx: &CancellationToken,
    client: &dyn ResourceClient,
    items: &[DynamicObject],
    opts: &DeleteOptions,
) -> Result<()> {
    for item in items {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        fire_pre(item, &opts.options.callbacks.pre)?;
        let (entry, outcome) = delete_object(ctx, client, item, opts.propagation.clone(), &opts.options.dry_run).await;
        fire_post(&entry, outcome, &opts.options.callbacks.post)?;
    }
    Ok(())
}
