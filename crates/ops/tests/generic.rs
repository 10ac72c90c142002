mod common;

use arbor_core::{dry_run_flags, Error};
use arbor_ops::{ApplyOptions, Callbacks, DeleteOptions, GenericOperator, Operator, Options};
use common::{object, recording_callbacks, FakeClient};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::PropagationPolicy;
use tokio_util::sync::CancellationToken;

fn function(name: &str) -> kube::core::DynamicObject {
    object("serverless.kyma-project.io/v1alpha1", "Function", name, &[])
}

#[tokio::test]
async fn applies_items_in_order_without_owner_refs_for_top_level() {
    let client = FakeClient::new();
    let mut op = GenericOperator::new(client.clone(), vec![function("a"), function("b")]);
    let (cbs, log) = recording_callbacks();
    let opts = ApplyOptions { owner_references: vec![], options: Options { dry_run: dry_run_flags(false), callbacks: cbs } };

    op.apply(&CancellationToken::new(), &opts).await.unwrap();

    assert_eq!(client.calls(), vec!["apply:a", "apply:b"]);
    assert_eq!(*log.lock().unwrap(), vec!["pre:a", "post:applied:a", "pre:b", "post:applied:b"]);
    assert!(client.stored("a").unwrap().metadata.owner_references.is_none());
    assert_eq!(op.items()[1].metadata.uid.as_deref(), Some("uid-b"));
}

#[tokio::test]
async fn stamps_inherited_owner_refs() {
    let client = FakeClient::new();
    let mut op = GenericOperator::new(client.clone(), vec![object("v1", "ConfigMap", "cm", &[])]);
    let owner = OwnerReference { api_version: "v1".into(), kind: "Owner".into(), name: "a".into(), uid: "u1".into(), ..Default::default() };
    let opts = ApplyOptions { owner_references: vec![owner.clone()], options: Options::default() };

    op.apply(&CancellationToken::new(), &opts).await.unwrap();

    assert_eq!(client.stored("cm").unwrap().metadata.owner_references, Some(vec![owner]));
}

#[tokio::test]
async fn apply_failure_reports_identity_and_stops() {
    let client = FakeClient::new();
    client.fail_apply_of("a");
    let mut op = GenericOperator::new(client.clone(), vec![function("a"), function("b")]);
    let (cbs, log) = recording_callbacks();
    let opts = ApplyOptions { owner_references: vec![], options: Options { dry_run: vec![], callbacks: cbs } };

    let err = op.apply(&CancellationToken::new(), &opts).await.unwrap_err();

    assert!(matches!(err, Error::Remote(_)));
    assert_eq!(*log.lock().unwrap(), vec!["pre:a", "post:apply-failed:a"]);
    assert_eq!(client.calls(), vec!["apply:a"]);
}

#[tokio::test]
async fn delete_removes_every_item() {
    let client = FakeClient::new();
    client.seed(function("a"));
    client.seed(function("b"));
    let mut op = GenericOperator::new(client.clone(), vec![function("a"), function("b")]);
    let opts = DeleteOptions { propagation: Some(PropagationPolicy::Foreground), options: Options { dry_run: vec![], callbacks: Callbacks::new() } };

    op.delete(&CancellationToken::new(), &opts).await.unwrap();

    assert_eq!(client.calls(), vec!["delete:a", "delete:b"]);
    assert!(client.names().is_empty());
}
