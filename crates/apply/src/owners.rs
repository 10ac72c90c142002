use std::sync::{Arc, Mutex, MutexGuard};

use arbor_core::{Error, StatusEntry};
use arbor_ops::{Callbacks, PostCallback};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

/// Accumulates owner references from successful item applies during one
/// operator call. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct OwnerReferenceList {
    refs: Arc<Mutex<Vec<OwnerReference>>>,
}

impl OwnerReferenceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `entry` unless the item failed.
    pub fn record(&self, entry: &StatusEntry, err: Option<&Error>) {
        if err.is_some() || entry.is_failed() {
            return;
        }
        self.lock().push(entry.owner_reference());
    }

    /// Post callback feeding this list. It never fails, so the operation's own
    /// outcome keeps flowing to the caller.
    pub fn harvester(&self) -> PostCallback {
        let list = self.clone();
        Arc::new(move |entry, err| {
            list.record(entry, err);
            Ok(())
        })
    }

    /// `callbacks` with the harvester appended after the caller's post hooks.
    pub fn wrap(&self, callbacks: &Callbacks) -> Callbacks {
        let mut wrapped = callbacks.clone();
        wrapped.post.push(self.harvester());
        wrapped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the harvested references.
    pub fn take(&self) -> Vec<OwnerReference> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OwnerReference>> {
        self.refs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
