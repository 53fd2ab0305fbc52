//! AccessRequest controller
//!
//! Drives an AccessRequest through `Pending -> AwaitingApproval -> Finished`
//! (or `Failed`). Every side effect goes through [`ensure`] or a guarded
//! create, so a reconcile can be repeated at any point and converges on the
//! same objects. The approval watcher in [`super::signing`] never talks to
//! this controller directly: its writes to the signing request come back
//! here as watch events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestSpec,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::signing::{decision_of, SigningDecision};
use super::{AUTO_APPROVE_ANNOTATION, FOR_NAMESPACE_LABEL, FOR_NAME_LABEL};
use crate::bootstrap;
use crate::config::Settings;
use crate::crd::{
    AccessPhase, AccessRequest, AccessRequestStatus, ConditionStatus, ConditionType, RoleRefSpec,
    RBAC_API_GROUP,
};
use crate::kubeconfig::{self, Credentials};
use crate::pki::CredentialMaterial;
use crate::store::{ensure, KubeStore, ObjectKey, ObjectStore, Subresource};
use crate::Error;

/// Secret key holding the PEM private key
pub const TLS_KEY: &str = "tls.key";
/// Secret key holding the PEM signing request
pub const TLS_CSR: &str = "tls.csr";
/// Secret key holding the PEM client certificate
pub const TLS_CRT: &str = "tls.crt";
/// Secret key holding the rendered access configuration
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Signer that issues client certificates trusted by the API server
pub const CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

const CLIENT_AUTH_USAGE: &str = "client auth";

/// Shared state for AccessRequest reconciles
///
/// Every store is a trait object so tests can swap in mocks or the
/// in-memory API server. Use [`Context::builder`] in production.
pub struct Context {
    /// AccessRequest objects (status writes)
    pub requests: Arc<dyn ObjectStore<AccessRequest>>,
    /// User, kubeconfig and pre-existing material secrets
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    /// Cluster-scoped signing requests
    pub signing_requests: Arc<dyn ObjectStore<CertificateSigningRequest>>,
    /// Role bindings for provisioned identities
    pub bindings: Arc<dyn ObjectStore<ClusterRoleBinding>>,
    /// Bootstrap ConfigMaps in `kube-public`
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    /// Runtime settings
    pub settings: Settings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context where one store serves every kind
    pub fn with_store<S>(store: Arc<S>, settings: Settings) -> Self
    where
        S: ObjectStore<AccessRequest>
            + ObjectStore<Secret>
            + ObjectStore<CertificateSigningRequest>
            + ObjectStore<ClusterRoleBinding>
            + ObjectStore<ConfigMap>
            + 'static,
    {
        Self {
            requests: store.clone(),
            secrets: store.clone(),
            signing_requests: store.clone(),
            bindings: store.clone(),
            config_maps: store,
            settings,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    settings: Settings,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            settings: Settings::default(),
        }
    }

    /// Override the runtime settings
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context::with_store(Arc::new(KubeStore::new(self.client)), self.settings)
    }
}

/// Reconcile an AccessRequest
///
/// Returns without blocking at every step that waits on someone else: the
/// signing request watch brings the object back once a decision or a
/// certificate lands. The only timed requeue is while an approved request
/// still has no certificate.
#[instrument(
    skip(request, ctx),
    fields(request = %request.name_any(), namespace = %request.namespace().unwrap_or_default())
)]
pub async fn reconcile(request: Arc<AccessRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let status = request.status_or_default();

    // Terminal objects are never reprocessed
    if status.is_terminal() {
        debug!(phase = %status.phase, "access request already settled");
        return Ok(Action::await_change());
    }

    info!(phase = %status.phase, "reconciling access request");

    if let Err(e) = request.spec.validate() {
        warn!(error = %e, "access request validation failed");
        return fail(&request, &ctx, status, e.reason(), &e.to_string()).await;
    }

    let result = match status.phase {
        AccessPhase::Pending => submit(&request, &ctx, status.clone()).await,
        AccessPhase::AwaitingApproval => observe(&request, &ctx, status.clone()).await,
        AccessPhase::Finished | AccessPhase::Failed => Ok(Action::await_change()),
    };

    match result {
        Err(e) if e.is_terminal() => {
            warn!(error = %e, "access request hit a terminal error");
            fail(&request, &ctx, status, e.reason(), &e.to_string()).await
        }
        other => other,
    }
}

/// Requeue policy for failed reconciles
///
/// Lost write races retry almost immediately with fresh state; other
/// transient errors back off a little.
pub fn error_policy(request: Arc<AccessRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(
            request = %request.name_any(),
            %error,
            "write conflict, retrying with fresh state"
        );
        return Action::requeue(Duration::from_secs(1));
    }

    error!(
        ?error,
        request = %request.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Map a signing request event to the AccessRequest that created it
///
/// Signing requests are cluster-scoped and cannot carry a usable owner
/// lookup for a namespaced owner, so the owner is found by label.
pub fn requester_ref(csr: CertificateSigningRequest) -> Option<ObjectRef<AccessRequest>> {
    let labels = csr.metadata.labels.as_ref()?;
    let name = labels.get(FOR_NAME_LABEL)?;
    let namespace = labels.get(FOR_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Pending: create the user secret, material and signing request
async fn submit(
    request: &AccessRequest,
    ctx: &Context,
    status: AccessRequestStatus,
) -> Result<Action, Error> {
    let namespace = namespace_of(request)?;
    let user_key = ObjectKey::namespaced(&namespace, request.user_secret_name());

    let user_secret = ensure(
        ctx.secrets.as_ref(),
        &user_key,
        || owned_secret(request, &user_key.name),
        |_: &mut Secret| {},
    )
    .await?
    .object;

    let status = status.condition(
        ConditionType::UserSecretCreated,
        ConditionStatus::True,
        "SecretWritten",
        format!("secret {} exists", user_key.name),
    );

    // Material already in the user secret came from an earlier attempt; a
    // fresh key would no longer match a signing request submitted with it.
    let material = match stored_material(&user_secret) {
        Some(material) => material?,
        None => match obtain_material(request, ctx, &namespace).await {
            Ok(material) => material,
            Err(e) if e.is_terminal() => {
                let reason = if request.spec.existing_secret.is_some() {
                    "ExistingSecretInvalid"
                } else {
                    e.reason()
                };
                let message = e.to_string();
                let status = status.condition(
                    ConditionType::SigningRequestCreated,
                    ConditionStatus::False,
                    reason,
                    &message,
                );
                return fail(request, ctx, status, reason, &message).await;
            }
            Err(e) => return Err(e),
        },
    };

    ensure(
        ctx.secrets.as_ref(),
        &user_key,
        || owned_secret(request, &user_key.name),
        |secret: &mut Secret| {
            set_data(secret, TLS_KEY, material.private_key_pem().as_bytes());
            set_data(secret, TLS_CSR, material.csr_pem().as_bytes());
        },
    )
    .await?;

    let csr_key = ObjectKey::cluster(request.signing_request_name());
    let desired = signing_request(request, &material)?;
    match ctx.signing_requests.create(&desired).await {
        Ok(_) => info!(signing_request = %csr_key, "submitted signing request"),
        Err(Error::AlreadyExists { .. }) => {
            let existing = ctx
                .signing_requests
                .get(&csr_key)
                .await?
                .ok_or_else(|| {
                    Error::missing_data(format!("signing request {csr_key} vanished after create conflict"))
                })?;
            if existing.spec.request.0 != material.csr_pem().as_bytes() {
                let message = format!(
                    "signing request {csr_key} exists with a different request"
                );
                let status = status.condition(
                    ConditionType::SigningRequestCreated,
                    ConditionStatus::False,
                    "SigningRequestConflict",
                    &message,
                );
                return fail(request, ctx, status, "SigningRequestConflict", &message).await;
            }
            debug!(signing_request = %csr_key, "signing request already submitted");
        }
        Err(e) => return Err(e),
    }

    let mut status = status
        .phase(AccessPhase::AwaitingApproval)
        .message(format!("waiting for a decision on signing request {csr_key}"))
        .condition(
            ConditionType::SigningRequestCreated,
            ConditionStatus::True,
            "SigningRequestSubmitted",
            format!("signing request {csr_key} submitted"),
        );
    status.user_secret = Some(user_key.name.clone());
    status.signing_request = Some(csr_key.name.clone());

    write_status(request, ctx, status).await?;
    Ok(Action::await_change())
}

/// AwaitingApproval: follow the signing request to a decision
async fn observe(
    request: &AccessRequest,
    ctx: &Context,
    status: AccessRequestStatus,
) -> Result<Action, Error> {
    if !status.is_true(ConditionType::SigningRequestCreated) {
        debug!("no submission recorded, submitting again");
        return submit(request, ctx, status).await;
    }

    let csr_key = ObjectKey::cluster(request.signing_request_name());
    let Some(csr) = ctx.signing_requests.get(&csr_key).await? else {
        if status.is_true(ConditionType::SigningRequestApproved) {
            info!(signing_request = %csr_key, "signing request gone after approval, finishing from stored certificate");
            return finish(request, ctx, status, None).await;
        }
        let message = format!("signing request {csr_key} disappeared before a decision");
        let status = status.condition(
            ConditionType::SigningRequestApproved,
            ConditionStatus::False,
            "SigningRequestDecayed",
            &message,
        );
        return fail(request, ctx, status, "SigningRequestDecayed", &message).await;
    };

    match decision_of(&csr) {
        None => {
            debug!(signing_request = %csr_key, "no decision yet");
            Ok(Action::await_change())
        }
        Some(SigningDecision::Denied(detail)) => {
            let message = format!("signing request {csr_key} denied: {detail}");
            let status = status.condition(
                ConditionType::SigningRequestApproved,
                ConditionStatus::False,
                "SigningRequestDenied",
                &message,
            );
            fail(request, ctx, status, "SigningRequestDenied", &message).await
        }
        Some(SigningDecision::Failed(detail)) => {
            let message = format!("signing request {csr_key} failed: {detail}");
            let status = status.condition(
                ConditionType::SigningRequestApproved,
                ConditionStatus::False,
                "SigningRequestFailed",
                &message,
            );
            fail(request, ctx, status, "SigningRequestFailed", &message).await
        }
        Some(SigningDecision::Approved) => {
            let status = status.condition(
                ConditionType::SigningRequestApproved,
                ConditionStatus::True,
                "Approved",
                format!("signing request {csr_key} approved"),
            );

            match csr
                .status
                .as_ref()
                .and_then(|s| s.certificate.as_ref())
                .filter(|c| !c.0.is_empty())
            {
                Some(certificate) => {
                    finish(request, ctx, status, Some(certificate.0.clone())).await
                }
                None => {
                    let status =
                        status.message("approved, waiting for the signer to issue the certificate");
                    write_status(request, ctx, status).await?;
                    info!(
                        signing_request = %csr_key,
                        delay = ?ctx.settings.certificate_requeue,
                        "approved without certificate, checking again later"
                    );
                    Ok(Action::requeue(ctx.settings.certificate_requeue))
                }
            }
        }
    }
}

/// Approved: store the certificate, render, bind, and mark Finished
///
/// With `certificate` None the certificate already stored in the user
/// secret is used.
async fn finish(
    request: &AccessRequest,
    ctx: &Context,
    status: AccessRequestStatus,
    certificate: Option<Vec<u8>>,
) -> Result<Action, Error> {
    let namespace = namespace_of(request)?;
    let user_key = ObjectKey::namespaced(&namespace, request.user_secret_name());
    let user_secret = ctx
        .secrets
        .get(&user_key)
        .await?
        .ok_or_else(|| Error::missing_data(format!("secret {user_key} not found")))?;

    let private_key = secret_value(&user_secret, TLS_KEY)
        .ok_or_else(|| Error::missing_data(format!("secret {user_key} has no {TLS_KEY}")))?
        .to_vec();

    let Some(certificate) =
        certificate.or_else(|| secret_value(&user_secret, TLS_CRT).map(<[u8]>::to_vec))
    else {
        let message = format!(
            "signing request {} is gone and no certificate was stored",
            request.signing_request_name()
        );
        return fail(request, ctx, status, "CertificateUnavailable", &message).await;
    };

    let trust_anchor = bootstrap::trust_anchor(ctx.config_maps.as_ref()).await?;
    let server = bootstrap::resolve_endpoint(
        ctx.config_maps.as_ref(),
        &request.spec.cluster.server,
        &ctx.settings.fallback_endpoint,
    )
    .await?;

    let config = kubeconfig::assemble(&Credentials {
        trust_anchor: trust_anchor.as_bytes(),
        certificate: &certificate,
        private_key: &private_key,
        cluster_name: &request.spec.cluster.name,
        server: &server,
        username: &request.spec.username,
    });
    let document = kubeconfig::encode(&config)?;

    // Secrets first: status never shows a document the secrets don't hold
    ensure(
        ctx.secrets.as_ref(),
        &user_key,
        || owned_secret(request, &user_key.name),
        |secret: &mut Secret| {
            set_data(secret, TLS_CRT, &certificate);
            set_data(secret, KUBECONFIG_KEY, document.as_bytes());
        },
    )
    .await?;

    let kubeconfig_key = ObjectKey::namespaced(&namespace, request.kubeconfig_secret_name());
    ensure(
        ctx.secrets.as_ref(),
        &kubeconfig_key,
        || owned_secret(request, &kubeconfig_key.name),
        |secret: &mut Secret| set_data(secret, KUBECONFIG_KEY, document.as_bytes()),
    )
    .await?;

    let role = request
        .spec
        .role_ref
        .clone()
        .unwrap_or_else(|| ctx.settings.default_role.clone());
    let binding_key = ObjectKey::cluster(binding_name(&request.spec.username, &role.name));
    // Created once; an existing binding of this name is left as it is
    ensure(
        ctx.bindings.as_ref(),
        &binding_key,
        || Ok(role_binding(request, &binding_key.name, &role)),
        |_: &mut ClusterRoleBinding| {},
    )
    .await?;

    let mut status = status
        .phase(AccessPhase::Finished)
        .message(format!("access for {} provisioned", request.spec.username))
        .condition(
            ConditionType::UserSecretFinished,
            ConditionStatus::True,
            "CertificateIssued",
            format!("secret {} holds the certificate", user_key.name),
        )
        .condition(
            ConditionType::KubeconfigSecretCreated,
            ConditionStatus::True,
            "SecretWritten",
            format!("secret {} holds the configuration", kubeconfig_key.name),
        )
        .condition(
            ConditionType::Finished,
            ConditionStatus::True,
            "Provisioned",
            format!("bound to {} {}", role.kind, role.name),
        );
    status.user_secret = Some(user_key.name.clone());
    status.signing_request = Some(request.signing_request_name());
    status.kubeconfig_secret = Some(kubeconfig_key.name.clone());
    status.kubeconfig = Some(document);

    write_status(request, ctx, status).await?;
    info!(binding = %binding_key, "access provisioned");
    Ok(Action::await_change())
}

/// Record a terminal failure
async fn fail(
    request: &AccessRequest,
    ctx: &Context,
    status: AccessRequestStatus,
    reason: &str,
    message: &str,
) -> Result<Action, Error> {
    warn!(reason, message, "access request failed");
    let status = status
        .phase(AccessPhase::Failed)
        .message(message)
        .condition(ConditionType::Finished, ConditionStatus::False, reason, message);
    write_status(request, ctx, status).await?;
    Ok(Action::await_change())
}

/// Write status through the status subresource, skipping no-op writes
///
/// The request's resourceVersion travels with the write, so a concurrent
/// writer turns this into [`Error::Conflict`].
async fn write_status(
    request: &AccessRequest,
    ctx: &Context,
    status: AccessRequestStatus,
) -> Result<(), Error> {
    if request.status.as_ref() == Some(&status) {
        debug!("status unchanged");
        return Ok(());
    }

    let phase = status.phase.clone();
    let mut updated = request.clone();
    updated.status = Some(status);
    ctx.requests
        .replace_subresource(Subresource::Status, &updated)
        .await?;
    debug!(%phase, "status updated");
    Ok(())
}

/// Key and request from the user secret, if an earlier attempt stored them
fn stored_material(secret: &Secret) -> Option<Result<CredentialMaterial, Error>> {
    let key = secret_value(secret, TLS_KEY)?;
    let csr = secret_value(secret, TLS_CSR)?;
    Some(material_from_bytes(key, csr))
}

/// Generate material, or load it from `spec.existingSecret`
async fn obtain_material(
    request: &AccessRequest,
    ctx: &Context,
    namespace: &str,
) -> Result<CredentialMaterial, Error> {
    let Some(existing) = &request.spec.existing_secret else {
        info!(algorithm = %request.spec.csr.signature_algorithm, "generating key material");
        return Ok(CredentialMaterial::generate(
            &request.spec.username,
            &request.spec.csr,
        )?);
    };

    let key = ObjectKey::namespaced(namespace, existing);
    let secret = ctx
        .secrets
        .get(&key)
        .await?
        .ok_or_else(|| Error::missing_data(format!("secret {key} not found")))?;

    let (Some(private_key), Some(csr)) =
        (secret_value(&secret, TLS_KEY), secret_value(&secret, TLS_CSR))
    else {
        return Err(Error::validation(format!(
            "secret {key} must hold both {TLS_KEY} and {TLS_CSR}"
        )));
    };

    info!(secret = %key, "using existing key material");
    material_from_bytes(private_key, csr)
}

fn material_from_bytes(key: &[u8], csr: &[u8]) -> Result<CredentialMaterial, Error> {
    let key = String::from_utf8(key.to_vec())
        .map_err(|_| Error::validation(format!("{TLS_KEY} is not PEM text")))?;
    let csr = String::from_utf8(csr.to_vec())
        .map_err(|_| Error::validation(format!("{TLS_CSR} is not PEM text")))?;
    Ok(CredentialMaterial::from_pem(key, csr)?)
}

fn namespace_of(request: &AccessRequest) -> Result<String, Error> {
    request
        .namespace()
        .ok_or_else(|| Error::missing_data("access request has no namespace"))
}

fn owner_labels(request: &AccessRequest) -> BTreeMap<String, String> {
    BTreeMap::from([
        (FOR_NAME_LABEL.to_string(), request.name_any()),
        (
            FOR_NAMESPACE_LABEL.to_string(),
            request.namespace().unwrap_or_default(),
        ),
    ])
}

/// Empty Opaque secret controlled by the request
fn owned_secret(request: &AccessRequest, name: &str) -> Result<Secret, Error> {
    let owner = request
        .controller_owner_ref(&())
        .ok_or_else(|| Error::missing_data("access request has no uid"))?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: request.namespace(),
            labels: Some(owner_labels(request)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

fn signing_request(
    request: &AccessRequest,
    material: &CredentialMaterial,
) -> Result<CertificateSigningRequest, Error> {
    let owner = request
        .controller_owner_ref(&())
        .ok_or_else(|| Error::missing_data("access request has no uid"))?;

    let annotations = request.spec.auto_approve.then(|| {
        BTreeMap::from([(AUTO_APPROVE_ANNOTATION.to_string(), "true".to_string())])
    });

    Ok(CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(request.signing_request_name()),
            labels: Some(owner_labels(request)),
            annotations,
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(material.csr_pem().as_bytes().to_vec()),
            signer_name: CLIENT_SIGNER.to_string(),
            usages: Some(vec![CLIENT_AUTH_USAGE.to_string()]),
            ..Default::default()
        },
        status: None,
    })
}

/// Name of the binding for an identity and role
pub fn binding_name(username: &str, role: &str) -> String {
    format!("kubeaccess:{}:{}", username, role)
}

fn user_subject(username: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "User".to_string(),
        name: username.to_string(),
        namespace: None,
    }
}

fn role_binding(request: &AccessRequest, name: &str, role: &RoleRefSpec) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(owner_labels(request)),
            ..Default::default()
        },
        role_ref: role.into(),
        subjects: Some(vec![user_subject(&request.spec.username)]),
    }
}

fn secret_value<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
        .filter(|value| !value.is_empty())
}

fn set_data(secret: &mut Secret, key: &str, value: &[u8]) {
    secret
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), ByteString(value.to_vec()));
}
