//! Integration tests for lookup classification
//!
//! Each story issues one lookup against a freshly started control plane and
//! checks how its failure (or success) is classified.

use std::time::Duration;

use kube::api::{Api, ApiResource, DynamicObject, PostParams};
use serde_json::json;

use retval_demo::client::{GenericClient, ObjectKey};
use retval_demo::kube_utils::gvk;
use retval_demo::lookup::{report, LookupOutcome, LookupTarget};
use retval_demo::DEFAULT_LOOKUP_TIMEOUT;

use super::helpers::{start_environment, start_manager};

// =============================================================================
// Story: a served kind with no such object
// =============================================================================

/// Looking up a ReplicaSet that was never created is "not found"
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_missing_replica_set_is_not_found() {
    let (mut env, config) = start_environment().await;
    let running = start_manager(config).await;

    let target = LookupTarget::new("apps/v1", "ReplicaSet", ObjectKey::namespaced("default", "a-name"));
    let outcome = report(&running.manager.client(), &target, DEFAULT_LOOKUP_TIMEOUT).await;
    assert_eq!(outcome, LookupOutcome::NotFound);

    running.stop().await.unwrap();
    env.stop().await.unwrap();
}

// =============================================================================
// Story: a kind the API server has no schema for
// =============================================================================

/// Badger is not part of apps/v1
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_unknown_kind_in_real_group_is_no_match() {
    let (mut env, config) = start_environment().await;
    let running = start_manager(config).await;

    let target = LookupTarget::new("apps/v1", "Badger", ObjectKey::namespaced("default", "a-name"));
    let outcome = report(&running.manager.client(), &target, DEFAULT_LOOKUP_TIMEOUT).await;
    assert_eq!(outcome, LookupOutcome::NoKindMatch);

    running.stop().await.unwrap();
    env.stop().await.unwrap();
}

/// A group the API server never heard of is no match either
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_unknown_group_is_no_match() {
    let (mut env, config) = start_environment().await;
    let running = start_manager(config).await;

    let target = LookupTarget::new(
        "inexistent.group.com/v1",
        "Gherkin",
        ObjectKey::namespaced("default", "a-name"),
    );
    let outcome = report(&running.manager.client(), &target, DEFAULT_LOOKUP_TIMEOUT).await;
    assert_eq!(outcome, LookupOutcome::NoKindMatch);

    running.stop().await.unwrap();
    env.stop().await.unwrap();
}

// =============================================================================
// Story: a malformed key
// =============================================================================

/// A namespace containing '/' yields an error; for an unserved group the
/// missing kind is what gets reported
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_malformed_namespace_is_an_error() {
    let (mut env, config) = start_environment().await;
    let running = start_manager(config).await;

    let client = running.manager.client();
    let result = client
        .get(
            &gvk("inexistent.group.com/v1", "Gherkin"),
            &ObjectKey::namespaced("in/valid", "a-name"),
        )
        .await;
    let err = result.unwrap_err();
    assert!(!err.is_not_found());

    let target = LookupTarget::new(
        "inexistent.group.com/v1",
        "Gherkin",
        ObjectKey::namespaced("in/valid", "a-name"),
    );
    let outcome = report(&client, &target, DEFAULT_LOOKUP_TIMEOUT).await;
    assert_eq!(outcome, LookupOutcome::NoKindMatch);

    // A served kind gets as far as the key
    let target = LookupTarget::new(
        "apps/v1",
        "ReplicaSet",
        ObjectKey::namespaced("in/valid", "a-name"),
    );
    let outcome = report(&client, &target, DEFAULT_LOOKUP_TIMEOUT).await;
    assert!(matches!(outcome, LookupOutcome::Unexpected(_)));

    running.stop().await.unwrap();
    env.stop().await.unwrap();
}

/// A namespace that is a valid path segment but not a valid label is left
/// to the API server, which has no such object
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_upper_case_namespace_is_not_found() {
    let (mut env, config) = start_environment().await;
    let running = start_manager(config).await;

    let target = LookupTarget::new(
        "apps/v1",
        "ReplicaSet",
        ObjectKey::namespaced("Default", "a-name"),
    );
    let outcome = report(&running.manager.client(), &target, DEFAULT_LOOKUP_TIMEOUT).await;
    assert_eq!(outcome, LookupOutcome::NotFound);

    running.stop().await.unwrap();
    env.stop().await.unwrap();
}

// =============================================================================
// Story: installed CRDs are visible to lookups
// =============================================================================

/// A Widget is not found until it is created, then found
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_installed_crd_kind_is_served() {
    let (mut env, config) = start_environment().await;
    assert!(env
        .installed_crds()
        .iter()
        .any(|name| name == "widgets.demo.example.com"));
    let running = start_manager(config).await;
    let client = running.manager.client();

    let target = LookupTarget::new(
        "demo.example.com/v1",
        "Widget",
        ObjectKey::namespaced("default", "blue"),
    );
    assert_eq!(
        report(&client, &target, DEFAULT_LOOKUP_TIMEOUT).await,
        LookupOutcome::NotFound
    );

    let resource = ApiResource::from_gvk_with_plural(&target.gvk, "widgets");
    let widgets: Api<DynamicObject> =
        Api::namespaced_with(running.manager.kube_client(), "default", &resource);
    let widget: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "demo.example.com/v1",
        "kind": "Widget",
        "metadata": { "name": "blue", "namespace": "default" },
        "spec": { "size": 3, "color": "blue" }
    }))
    .unwrap();
    widgets
        .create(&PostParams::default(), &widget)
        .await
        .expect("widget should be created");

    assert_eq!(
        report(&client, &target, Duration::from_secs(5)).await,
        LookupOutcome::Found
    );

    running.stop().await.unwrap();
    env.stop().await.unwrap();
}
