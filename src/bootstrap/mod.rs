//! Cluster bootstrap inputs
//!
//! The trust anchor and the public API endpoint are published by the control
//! plane in `kube-public`. Both are read on demand, never cached, so a
//! rotated CA shows up in the next rendered configuration.

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::{debug, warn};

use crate::kubeconfig;
use crate::store::{ObjectKey, ObjectStore};
use crate::Error;

/// Namespace holding the public cluster information
pub const PUBLIC_NAMESPACE: &str = "kube-public";

/// ConfigMap holding the cluster CA bundle
pub const ROOT_CA_CONFIGMAP: &str = "kube-root-ca.crt";

/// Key of the CA bundle in [`ROOT_CA_CONFIGMAP`]
pub const ROOT_CA_KEY: &str = "ca.crt";

/// ConfigMap holding the kubeadm discovery kubeconfig
pub const CLUSTER_INFO_CONFIGMAP: &str = "cluster-info";

/// Key of the discovery kubeconfig in [`CLUSTER_INFO_CONFIGMAP`]
pub const CLUSTER_INFO_KEY: &str = "kubeconfig";

/// Read the cluster CA certificate PEM
///
/// Absence is a transient error: the control plane publishes it shortly
/// after start.
pub async fn trust_anchor(store: &dyn ObjectStore<ConfigMap>) -> Result<String, Error> {
    let key = ObjectKey::namespaced(PUBLIC_NAMESPACE, ROOT_CA_CONFIGMAP);
    let config_map = store
        .get(&key)
        .await?
        .ok_or_else(|| Error::missing_data(format!("configmap {key} not found")))?;

    config_map
        .data
        .and_then(|mut data| data.remove(ROOT_CA_KEY))
        .filter(|ca| !ca.is_empty())
        .ok_or_else(|| Error::missing_data(format!("configmap {key} has no {ROOT_CA_KEY}")))
}

/// Pick the API endpoint for rendered configurations
///
/// Order: explicit endpoint, then the discovery kubeconfig, then `fallback`.
/// A missing or unreadable discovery document is not an error.
pub async fn resolve_endpoint(
    store: &dyn ObjectStore<ConfigMap>,
    explicit: &str,
    fallback: &str,
) -> Result<String, Error> {
    if !explicit.is_empty() {
        return Ok(explicit.to_string());
    }

    let key = ObjectKey::namespaced(PUBLIC_NAMESPACE, CLUSTER_INFO_CONFIGMAP);
    let document = store
        .get(&key)
        .await?
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(CLUSTER_INFO_KEY));

    let Some(document) = document else {
        debug!(configmap = %key, fallback, "no discovery document, using fallback endpoint");
        return Ok(fallback.to_string());
    };

    match kubeconfig::decode(&document) {
        Ok(config) => match config.server_for("") {
            Some(server) => Ok(server.to_string()),
            None => {
                debug!(configmap = %key, fallback, "discovery document has no server");
                Ok(fallback.to_string())
            }
        },
        Err(e) => {
            warn!(configmap = %key, error = %e, "unreadable discovery document, using fallback endpoint");
            Ok(fallback.to_string())
        }
    }
}
