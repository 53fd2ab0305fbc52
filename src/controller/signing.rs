//! Approval watcher for signing requests
//!
//! Approves signing requests that an AccessRequest submitted with
//! `autoApprove`, after checking that the embedded request parses. Every
//! other signing request in the cluster is left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::AUTO_APPROVE_ANNOTATION;
use crate::crd::AccessRequest;
use crate::pki;
use crate::store::{KubeStore, ObjectStore, Subresource};
use crate::Error;

/// Reason recorded on approvals
pub const APPROVAL_REASON: &str = "AutoApproved";

/// Message recorded on approvals
pub const APPROVAL_MESSAGE: &str = "approved by kubeaccess";

/// Reason recorded when the embedded request does not parse
pub const MALFORMED_REASON: &str = "MalformedRequest";

/// Decision recorded on a signing request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigningDecision {
    /// Approved; the certificate may still be on its way
    Approved,
    /// Denied, with the recorded message
    Denied(String),
    /// Failed, with the recorded message
    Failed(String),
}

/// Read the decision from a signing request's conditions
///
/// Failed wins over Approved: a signer may fail a request after approval.
pub fn decision_of(csr: &CertificateSigningRequest) -> Option<SigningDecision> {
    let conditions = csr.status.as_ref()?.conditions.as_ref()?;
    let active = |type_: &str| {
        conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
    };
    let detail = |c: &CertificateSigningRequestCondition| {
        c.message
            .clone()
            .or_else(|| c.reason.clone())
            .unwrap_or_default()
    };

    if let Some(c) = active("Failed") {
        return Some(SigningDecision::Failed(detail(c)));
    }
    if let Some(c) = active("Denied") {
        return Some(SigningDecision::Denied(detail(c)));
    }
    active("Approved").map(|_| SigningDecision::Approved)
}

/// Shared state for signing request reconciles
pub struct SigningContext {
    /// Cluster-scoped signing requests
    pub signing_requests: Arc<dyn ObjectStore<CertificateSigningRequest>>,
}

impl SigningContext {
    /// Create a context backed by the Kubernetes API
    pub fn new(client: Client) -> Self {
        Self::with_store(Arc::new(KubeStore::new(client)))
    }

    /// Create a context over any signing request store
    pub fn with_store(signing_requests: Arc<dyn ObjectStore<CertificateSigningRequest>>) -> Self {
        Self { signing_requests }
    }
}

/// Returns true if an AccessRequest controls this signing request
pub fn is_owned(csr: &CertificateSigningRequest) -> bool {
    let api_version = AccessRequest::api_version(&());
    let kind = AccessRequest::kind(&());
    csr.owner_references()
        .iter()
        .any(|o| o.kind == kind && o.api_version == api_version)
}

fn wants_auto_approval(csr: &CertificateSigningRequest) -> bool {
    csr.annotations()
        .get(AUTO_APPROVE_ANNOTATION)
        .is_some_and(|v| v == "true")
}

fn condition(type_: &str, reason: &str, message: String) -> CertificateSigningRequestCondition {
    let now = Time(Utc::now());
    CertificateSigningRequestCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

/// Reconcile a signing request
///
/// Decides once. Requests that already carry a decision, are not ours, or
/// are not marked for automatic approval produce no writes.
#[instrument(skip(csr, ctx), fields(signing_request = %csr.name_any()))]
pub async fn reconcile_signing_request(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<SigningContext>,
) -> Result<Action, Error> {
    if !is_owned(&csr) {
        debug!("not created by an access request, ignoring");
        return Ok(Action::await_change());
    }

    if let Some(decision) = decision_of(&csr) {
        debug!(?decision, "already decided");
        return Ok(Action::await_change());
    }

    if !wants_auto_approval(&csr) {
        debug!("waiting for manual approval");
        return Ok(Action::await_change());
    }

    let mut decided = (*csr).clone();
    let conditions = decided
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Vec::new);

    match pki::parse_signing_request(&csr.spec.request.0) {
        Ok(parsed) => {
            conditions.push(condition(
                "Approved",
                APPROVAL_REASON,
                APPROVAL_MESSAGE.to_string(),
            ));
            ctx.signing_requests
                .replace_subresource(Subresource::Approval, &decided)
                .await?;
            info!(common_name = ?parsed.common_name, "approved signing request");
        }
        Err(e) => {
            warn!(error = %e, "signing request does not parse, marking failed");
            conditions.push(condition("Failed", MALFORMED_REASON, e.to_string()));
            ctx.signing_requests
                .replace_subresource(Subresource::Status, &decided)
                .await?;
        }
    }

    Ok(Action::await_change())
}

/// Requeue policy for failed signing request reconciles
pub fn signing_error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &Error,
    _ctx: Arc<SigningContext>,
) -> Action {
    if error.is_conflict() {
        debug!(signing_request = %csr.name_any(), %error, "write conflict, retrying");
        return Action::requeue(Duration::from_secs(1));
    }

    error!(
        ?error,
        signing_request = %csr.name_any(),
        "signing request reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
