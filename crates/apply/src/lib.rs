//! Arbor apply: walks a forest of parent operators and their children, threading
//! owner references from each parent's apply into its children, with optional
//! purge of every parent when anything fails.

#![forbid(unsafe_code)]

use std::time::Instant;

use arbor_core::{dry_run_flags, Result};
use arbor_ops::{ApplyOptions, Callbacks, DeleteOptions, Operator};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::PropagationPolicy;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod owners;

pub use owners::OwnerReferenceList;

/// An operator slot. `None` is a valid no-op operator.
pub type Slot = Option<Box<dyn Operator>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    #[default]
    StopOnError,
    /// Best-effort delete of every parent after the first failure.
    PurgeOnError,
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub dry_run: bool,
    /// Harvest owner references from parent applies and hand them to the children.
    pub set_owner_references: bool,
    pub on_error: OnError,
    pub callbacks: Callbacks,
}

/// Applies parents strictly before their children, entry by entry in insertion order.
///
/// `run` takes `&mut self`; concurrent runs need separate managers.
#[derive(Default)]
pub struct Manager {
    forest: Vec<(Slot, Vec<Slot>)>,
}

impl Manager {
    pub fn new(forest: Vec<(Slot, Vec<Slot>)>) -> Self {
        Self { forest }
    }

    pub fn push(&mut self, parent: Slot, children: Vec<Slot>) -> &mut Self {
        self.forest.push((parent, children));
        self
    }

    pub fn len(&self) -> usize {
        self.forest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forest.is_empty()
    }

    /// Apply the whole forest, stopping at the first error. Under
    /// `OnError::PurgeOnError` every parent is deleted before the original error is returned.
    pub async fn run(&mut self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        let t0 = Instant::now();
        counter!("manager_runs_total", 1u64);
        info!(entries = self.forest.len(), dry_run = options.dry_run, owner_refs = options.set_owner_references, "apply started");
        let res = self.manage_operators(ctx, options).await;
        histogram!("manager_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                info!("apply finished");
                Ok(())
            }
            Err(e) => {
                counter!("manager_errors_total", 1u64);
                warn!(error = %e, on_error = ?options.on_error, "apply failed");
                if options.on_error == OnError::PurgeOnError {
                    self.purge_parents(options).await;
                }
                Err(e)
            }
        }
    }

    async fn manage_operators(&mut self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        for (idx, (parent, children)) in self.forest.iter_mut().enumerate() {
            let references = use_operator(ctx, parent, options, Vec::new()).await?;
            debug!(entry = idx, harvested = references.len(), children = children.len(), "parent applied");
            for child in children.iter_mut() {
                use_operator(ctx, child, options, references.clone()).await?;
            }
        }
        Ok(())
    }

    /// Delete every parent with foreground propagation. Runs on a fresh token so a
    /// cancelled run still gets cleaned up; failures are logged and dropped.
    async fn purge_parents(&mut self, options: &Options) {
        counter!("manager_purge_total", 1u64);
        let ctx = CancellationToken::new();
        let delete_opts = DeleteOptions {
            propagation: Some(PropagationPolicy::Foreground),
            options: arbor_ops::Options { dry_run: dry_run_flags(options.dry_run), callbacks: options.callbacks.clone() },
        };
        for (idx, (parent, _)) in self.forest.iter_mut().enumerate() {
            let Some(opr) = parent.as_mut() else { continue };
            if let Err(e) = opr.delete(&ctx, &delete_opts).await {
                counter!("manager_purge_errors_total", 1u64);
                warn!(entry = idx, error = %e, "purge delete failed; continuing");
            }
        }
    }
}

/// Apply one operator and return the owner references harvested from it.
async fn use_operator(
    ctx: &CancellationToken,
    slot: &mut Slot,
    options: &Options,
    references: Vec<OwnerReference>,
) -> Result<Vec<OwnerReference>> {
    let harvested = OwnerReferenceList::new();
    let Some(opr) = slot.as_mut() else { return Ok(Vec::new()) };

    let callbacks = if options.set_owner_references { harvested.wrap(&options.callbacks) } else { options.callbacks.clone() };
    let apply_opts = ApplyOptions {
        owner_references: references,
        options: arbor_ops::Options { dry_run: dry_run_flags(options.dry_run), callbacks },
    };
    opr.apply(ctx, &apply_opts).await?;
    Ok(harvested.take())
}
