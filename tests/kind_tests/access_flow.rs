//! Integration tests for the provisioning flow
//!
//! The reconcilers run against the kind API server, and the cluster's own
//! `kube-apiserver-client` signer issues the certificates. Each test drives
//! the reconcilers by hand, the way watch events would.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::time::sleep;

use kubeaccess::controller::{
    reconcile, reconcile_signing_request, Context, SigningContext, KUBECONFIG_KEY,
};
use kubeaccess::crd::{AccessPhase, AccessRequest, ConditionType};

use super::helpers::{
    cleanup_request, ensure_test_cluster, sample_request, TEST_CLUSTER_NAME, TEST_NAMESPACE,
};

/// API server URL as seen from the test process
async fn host_endpoint() -> String {
    let config = Config::from_kubeconfig(&KubeConfigOptions {
        context: Some(format!("kind-{TEST_CLUSTER_NAME}")),
        ..Default::default()
    })
    .await
    .expect("failed to load kubeconfig");
    config.cluster_url.to_string().trim_end_matches('/').to_string()
}

async fn current(api: &Api<AccessRequest>, name: &str) -> Arc<AccessRequest> {
    Arc::new(api.get(name).await.expect("failed to get AccessRequest"))
}

/// Story: An auto-approved request ends with a working kubeconfig
///
/// The operator submits the signing request, approves it, waits for the
/// cluster signer and renders a configuration. That configuration then
/// authenticates as the requested user, who is bound to cluster-admin.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_auto_approved_request_produces_working_kubeconfig() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<AccessRequest> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());
    let name = "flow-auto";

    cleanup_request(&client, name).await;
    let mut request = sample_request(name, "integration-alice", true);
    request.spec.cluster.server = host_endpoint().await;
    api.create(&PostParams::default(), &request)
        .await
        .expect("failed to create AccessRequest");

    let access_ctx = Arc::new(Context::builder(client.clone()).build());
    let signing_ctx = Arc::new(SigningContext::new(client.clone()));

    reconcile(current(&api, name).await, access_ctx.clone())
        .await
        .expect("submission failed");
    assert_eq!(
        current(&api, name).await.status_or_default().phase,
        AccessPhase::AwaitingApproval
    );

    let csr_name = format!("{TEST_NAMESPACE}.{name}");
    let csr = csrs.get(&csr_name).await.expect("signing request missing");
    reconcile_signing_request(Arc::new(csr), signing_ctx)
        .await
        .expect("approval failed");

    // The signer issues asynchronously after approval
    let mut phase = AccessPhase::AwaitingApproval;
    for _ in 0..30 {
        reconcile(current(&api, name).await, access_ctx.clone())
            .await
            .expect("reconcile failed");
        phase = current(&api, name).await.status_or_default().phase;
        if phase == AccessPhase::Finished {
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(phase, AccessPhase::Finished);

    let status = current(&api, name).await.status_or_default();
    assert!(status.is_true(ConditionType::Finished));

    let secrets: Api<Secret> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let secret = secrets
        .get(&format!("{name}-kubeconfig"))
        .await
        .expect("kubeconfig secret missing");
    let document = String::from_utf8(secret.data.unwrap()[KUBECONFIG_KEY].0.clone()).unwrap();
    assert_eq!(Some(&document), status.kubeconfig.as_ref());

    let kubeconfig = Kubeconfig::from_yaml(&document).expect("rendered kubeconfig does not parse");
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .expect("rendered kubeconfig is not usable");
    let user_client = Client::try_from(config).unwrap();
    let namespaces: Api<Namespace> = Api::all(user_client);
    namespaces
        .list(&ListParams::default().limit(1))
        .await
        .expect("rendered credentials were rejected");

    cleanup_request(&client, name).await;
}

/// Story: Without auto-approval the request waits for an administrator
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_manual_request_waits_for_administrator() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<AccessRequest> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());
    let name = "flow-manual";

    cleanup_request(&client, name).await;
    api.create(
        &PostParams::default(),
        &sample_request(name, "integration-bob", false),
    )
    .await
    .expect("failed to create AccessRequest");

    let access_ctx = Arc::new(Context::builder(client.clone()).build());
    let signing_ctx = Arc::new(SigningContext::new(client.clone()));

    reconcile(current(&api, name).await, access_ctx.clone())
        .await
        .unwrap();

    let csr_name = format!("{TEST_NAMESPACE}.{name}");
    let csr = csrs.get(&csr_name).await.unwrap();
    reconcile_signing_request(Arc::new(csr), signing_ctx)
        .await
        .unwrap();

    let csr = csrs.get(&csr_name).await.unwrap();
    assert!(csr.status.and_then(|s| s.conditions).is_none());

    reconcile(current(&api, name).await, access_ctx)
        .await
        .unwrap();
    assert_eq!(
        current(&api, name).await.status_or_default().phase,
        AccessPhase::AwaitingApproval
    );

    cleanup_request(&client, name).await;
}
