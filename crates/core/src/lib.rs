//! Arbor core types: status entries, owner references and the error taxonomy
//! shared by operators and the orchestration manager.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

/// Marker passed to the remote store to validate without persisting.
pub const DRY_RUN_ALL: &str = "All";

/// Translate a boolean dry-run option into the flag set handed to every remote call.
pub fn dry_run_flags(dry_run: bool) -> Vec<String> {
    let mut flags = Vec::new();
    if dry_run {
        flags.push(DRY_RUN_ALL.to_string());
    }
    flags
}

pub fn is_dry_run(flags: &[String]) -> bool {
    flags.iter().any(|f| f == DRY_RUN_ALL)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusKind {
    Applied,
    ApplyFailed,
    Deleted,
    DeleteFailed,
}

impl StatusKind {
    pub fn is_failed(self) -> bool {
        matches!(self, StatusKind::ApplyFailed | StatusKind::DeleteFailed)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusKind::Applied => "applied",
            StatusKind::ApplyFailed => "apply-failed",
            StatusKind::Deleted => "deleted",
            StatusKind::DeleteFailed => "delete-failed",
        };
        f.pad(s)
    }
}

/// Result of applying or deleting a single item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: StatusKind,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Absent for failed creates and for some dry-run responses
    pub uid: Option<String>,
}

impl StatusEntry {
    /// Build an entry carrying the identity of `obj`.
    pub fn from_object(status: StatusKind, obj: &DynamicObject) -> Self {
        let (api_version, kind) = obj
            .types
            .as_ref()
            .map(|t| (t.api_version.clone(), t.kind.clone()))
            .unwrap_or_default();
        Self {
            status,
            api_version,
            kind,
            name: obj.metadata.name.clone().unwrap_or_default(),
            uid: obj.metadata.uid.clone(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<14} {}/{} {}", self.status, self.api_version, self.kind, self.name)
    }
}

/// Errors surfaced by operators and the manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required inherited owner reference is missing.
    #[error("not_found: {0}")]
    NotFound(String),
    /// A pre or post callback rejected an item.
    #[error("callback: {0:#}")]
    Callback(anyhow::Error),
    /// The remote client call failed.
    #[error("remote: {0:#}")]
    Remote(anyhow::Error),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn object(json: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn dry_run_flags_are_empty_or_all() {
        assert!(dry_run_flags(false).is_empty());
        assert_eq!(dry_run_flags(true), vec!["All".to_string()]);
        assert!(is_dry_run(&dry_run_flags(true)));
        assert!(!is_dry_run(&[]));
    }

    #[test]
    fn status_entry_carries_object_identity() {
        let obj = object(serde_json::json!({
            "apiVersion": "serverless.kyma-project.io/v1alpha1",
            "kind": "Function",
            "metadata": { "name": "fn-a", "uid": "u1" }
        }));
        let entry = StatusEntry::from_object(StatusKind::Applied, &obj);
        assert_eq!(entry.api_version, "serverless.kyma-project.io/v1alpha1");
        assert_eq!(entry.kind, "Function");
        assert_eq!(entry.name, "fn-a");
        assert_eq!(entry.uid.as_deref(), Some("u1"));

        let r = entry.owner_reference();
        assert_eq!(r.kind, "Function");
        assert_eq!(r.name, "fn-a");
        assert_eq!(r.uid, "u1");
        assert!(r.controller.is_none());
    }

    #[test]
    fn only_failed_kinds_are_failed() {
        assert!(StatusKind::ApplyFailed.is_failed());
        assert!(StatusKind::DeleteFailed.is_failed());
        assert!(!StatusKind::Applied.is_failed());
        assert!(!StatusKind::Deleted.is_failed());
    }

    #[test]
    fn errors_render_with_prefix() {
        let e = Error::NotFound("ownerID".into());
        assert_eq!(e.to_string(), "not_found: ownerID");
        let e = Error::Remote(anyhow::anyhow!("boom"));
        assert_eq!(e.to_string(), "remote: boom");
    }
}
