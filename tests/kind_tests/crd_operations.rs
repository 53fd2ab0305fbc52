//! Integration tests for CRD operations
//!
//! These tests tell the story of how administrators interact with
//! AccessRequest resources through the Kubernetes API.

use kube::api::{Api, ApiResource, DynamicObject, PostParams};

use kubeaccess::crd::{
    AccessPhase, AccessRequest, AccessRequestStatus, ConditionStatus, ConditionType,
};

use super::helpers::{cleanup_request, ensure_test_cluster, sample_request, TEST_NAMESPACE};

/// Story: Administrator creates an AccessRequest and reads it back
///
/// Defaulted fields (algorithm, cluster name) come back on read,
/// and the object starts without status until the controller sees it.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_admin_creates_access_request() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<AccessRequest> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-create";

    cleanup_request(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_request(name, "alice", false))
        .await
        .expect("failed to create AccessRequest");
    assert!(created.metadata.uid.is_some());

    let fetched = api.get(name).await.expect("failed to get AccessRequest");
    assert_eq!(fetched.spec.username, "alice");
    assert_eq!(fetched.spec.cluster.name, "kubernetes");
    assert!(fetched.status.is_none());

    cleanup_request(&client, name).await;
}

/// Story: Status is written through its own subresource
///
/// The controller never touches spec; a status write leaves spec as the
/// administrator declared it.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_status_subresource_is_separate_from_spec() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<AccessRequest> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-status";

    cleanup_request(&client, name).await;
    let mut request = api
        .create(&PostParams::default(), &sample_request(name, "bob", false))
        .await
        .expect("failed to create AccessRequest");

    request.status = Some(
        AccessRequestStatus::with_phase(AccessPhase::AwaitingApproval).condition(
            ConditionType::SigningRequestCreated,
            ConditionStatus::True,
            "SigningRequestSubmitted",
            "submitted",
        ),
    );
    request.spec.username = "mallory".to_string();
    api.replace_status(
        name,
        &PostParams::default(),
        serde_json::to_vec(&request).unwrap(),
    )
    .await
    .expect("failed to write status");

    let fetched = api.get(name).await.unwrap();
    assert_eq!(fetched.spec.username, "bob");
    let status = fetched.status.unwrap();
    assert_eq!(status.phase, AccessPhase::AwaitingApproval);
    assert!(status.is_true(ConditionType::SigningRequestCreated));

    cleanup_request(&client, name).await;
}

/// Story: The schema rejects algorithms it does not know
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_unknown_algorithm_rejected_by_schema() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let resource = ApiResource::erase::<AccessRequest>(&());
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), TEST_NAMESPACE, &resource);

    let mut object = DynamicObject::new("crd-bad-algorithm", &resource);
    object.data = serde_json::json!({
        "spec": {
            "username": "carol",
            "csr": { "signatureAlgorithm": "MD5WithRSA" }
        }
    });

    let result = api.create(&PostParams::default(), &object).await;
    assert!(
        matches!(result, Err(kube::Error::Api(ref e)) if e.code == 422),
        "expected schema rejection, got {result:?}"
    );
}
