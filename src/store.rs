//! Object store access and idempotent upserts
//!
//! Controllers talk to the API server only through [`ObjectStore`], so the
//! reconcile logic can run against mocks or the in-memory fake in tests.
//! [`ensure`] is the single find-or-create/update primitive used for every
//! owned object.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::AccessRequest;
use crate::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "kubeaccess-controller";

/// Namespace and name of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, or None for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Writable subresources
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    /// `/status`
    Status,
    /// `/approval` of a CertificateSigningRequest
    Approval,
}

impl Subresource {
    /// Path segment of the subresource
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Approval => "approval",
        }
    }
}

/// Trait abstracting object store operations for one kind
///
/// Writes carry the object's resourceVersion; a stale version yields
/// [`Error::Conflict`], a create on an existing key [`Error::AlreadyExists`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<K: Send + Sync + 'static>: Send + Sync {
    /// Get an object, None if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error>;

    /// Create an object
    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Replace an object
    async fn replace(&self, obj: &K) -> Result<K, Error>;

    /// Replace a subresource of an object
    async fn replace_subresource(&self, subresource: Subresource, obj: &K) -> Result<K, Error>;
}

/// Kinds the operator reads or writes, with their API scope
pub trait StoreResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// API handle for the given namespace (ignored for cluster-scoped kinds)
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

impl StoreResource for Secret {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

impl StoreResource for ConfigMap {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

impl StoreResource for AccessRequest {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

impl StoreResource for CertificateSigningRequest {
    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }
}

impl StoreResource for ClusterRoleBinding {
    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }
}

/// Real object store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Translate 409 responses into the store's conflict errors
fn write_error<K: Resource<DynamicType = ()>>(e: kube::Error, name: &str, creating: bool) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => {
            let kind = K::kind(&()).to_string();
            if creating {
                Error::already_exists(kind, name)
            } else {
                Error::conflict(kind, name)
            }
        }
        other => Error::Kube(other),
    }
}

#[async_trait]
impl<K: StoreResource> ObjectStore<K> for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        let api = K::api(self.client.clone(), key.namespace.as_deref());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        let name = obj.name_any();
        api.create(&post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(e, &name, true))
    }

    async fn replace(&self, obj: &K) -> Result<K, Error> {
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        let name = obj.name_any();
        api.replace(&name, &post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(e, &name, false))
    }

    async fn replace_subresource(&self, subresource: Subresource, obj: &K) -> Result<K, Error> {
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        let name = obj.name_any();
        let body = serde_json::to_vec(obj)?;
        api.replace_subresource(subresource.as_str(), &name, &post_params(), body)
            .await
            .map_err(|e| write_error::<K>(e, &name, false))
    }
}

/// Result of [`ensure`]
#[derive(Clone, Debug)]
pub struct Ensured<K> {
    /// The object as stored after the call
    pub object: K,
    /// True if this call created the object
    pub created: bool,
    /// True if this call updated an existing object
    pub updated: bool,
}

/// Find-or-create an object, then bring mutable fields up to date
///
/// - not found: build with `construct` and create
/// - found: apply `mutate` and replace only if that changed anything
///
/// A create that races another writer falls back to the update path, so
/// repeated or concurrent calls never produce a duplicate create.
pub async fn ensure<K, S, C, M>(
    store: &S,
    key: &ObjectKey,
    construct: C,
    mutate: M,
) -> Result<Ensured<K>, Error>
where
    K: Resource<DynamicType = ()> + Clone + PartialEq + Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
    C: FnOnce() -> Result<K, Error>,
    M: Fn(&mut K),
{
    let kind = K::kind(&());

    let existing = match store.get(key).await? {
        Some(obj) => obj,
        None => {
            let mut obj = construct()?;
            mutate(&mut obj);
            match store.create(&obj).await {
                Ok(created) => {
                    info!(%kind, object = %key, "created object");
                    return Ok(Ensured {
                        object: created,
                        created: true,
                        updated: false,
                    });
                }
                Err(Error::AlreadyExists { .. }) => {
                    debug!(%kind, object = %key, "object appeared concurrently, updating instead");
                    store.get(key).await?.ok_or_else(|| {
                        Error::missing_data(format!("{kind} {key} vanished after create conflict"))
                    })?
                }
                Err(e) => return Err(e),
            }
        }
    };

    let mut desired = existing.clone();
    mutate(&mut desired);
    if desired == existing {
        debug!(%kind, object = %key, "object up to date");
        return Ok(Ensured {
            object: existing,
            created: false,
            updated: false,
        });
    }

    let updated = store.replace(&desired).await?;
    info!(%kind, object = %key, "updated object");
    Ok(Ensured {
        object: updated,
        created: false,
        updated: true,
    })
}
