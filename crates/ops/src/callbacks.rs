//! Pre/Post hook chain fired around every item apply or delete.

use std::sync::Arc;

use arbor_core::{Error, Result, StatusEntry};
use kube::core::DynamicObject;

/// Sees the item about to be applied or deleted; an error aborts that item.
pub type PreCallback = Arc<dyn Fn(&DynamicObject) -> anyhow::Result<()> + Send + Sync>;

/// Sees the outcome of one item; an error aborts the whole operator call.
pub type PostCallback = Arc<dyn Fn(&StatusEntry, Option<&Error>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub pre: Vec<PreCallback>,
    pub post: Vec<PostCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pre<F>(mut self, f: F) -> Self
    where
        F: Fn(&DynamicObject) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.pre.push(Arc::new(f));
        self
    }

    pub fn on_post<F>(mut self, f: F) -> Self
    where
        F: Fn(&StatusEntry, Option<&Error>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.post.push(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").field("pre", &self.pre.len()).field("post", &self.post.len()).finish()
    }
}

pub fn fire_pre(obj: &DynamicObject, callbacks: &[PreCallback]) -> Result<()> {
    for cb in callbacks {
        cb(obj).map_err(Error::Callback)?;
    }
    Ok(())
}

/// Run every post callback against `outcome`. The first callback error wins;
/// otherwise the operation's own outcome is handed back unchanged.
pub fn fire_post(entry: &StatusEntry, outcome: Result<()>, callbacks: &[PostCallback]) -> Result<()> {
    for cb in callbacks {
        cb(entry, outcome.as_ref().err()).map_err(Error::Callback)?;
    }
    outcome
}
