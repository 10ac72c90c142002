use std::sync::Arc;

use arbor_core::Result;
use arbor_kubehub::ResourceClient;
use kube::core::DynamicObject;
use tokio_util::sync::CancellationToken;

use crate::{apply_items, delete_items, ApplyOptions, DeleteOptions, Operator};

/// Applies a list of documents in order, stamping inherited owner references on each.
pub struct GenericOperator {
    client: Arc<dyn ResourceClient>,
    items: Vec<DynamicObject>,
}

impl GenericOperator {
    pub fn new(client: Arc<dyn ResourceClient>, items: Vec<DynamicObject>) -> Self {
        Self { client, items }
    }

    pub fn items(&self) -> &[DynamicObject] {
        &self.items
    }
}

#[async_trait::async_trait]
impl Operator for GenericOperator {
    async fn apply(&mut self, ctx: &CancellationToken, opts: &ApplyOptions) -> Result<()> {
        let refs = &opts.owner_references;
        apply_items(ctx, self.client.as_ref(), &mut self.items, &opts.options, |item| {
            if !refs.is_empty() {
                item.metadata.owner_references = Some(refs.clone());
            }
        })
        .await
    }

    async fn delete(&mut self, ctx: &CancellationToken, opts: &DeleteOptions) -> Result<()> {
        delete_items(ctx, self.client.as_ref(), &self.items, opts).await
    }
}
