//! Runtime settings shared by the controllers

use std::time::Duration;

use crate::crd::RoleRefSpec;

/// Delay before re-checking an approved signing request without certificate
pub const DEFAULT_CERTIFICATE_REQUEUE: Duration = Duration::from_secs(15);

/// API endpoint used when neither the request nor cluster-info provides one
pub const DEFAULT_FALLBACK_ENDPOINT: &str = "https://localhost:6443";

/// ClusterRole bound when the request has no role reference
pub const DEFAULT_CLUSTER_ROLE: &str = "cluster-admin";

/// Controller settings
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Requeue delay while waiting for the signer to populate the certificate
    pub certificate_requeue: Duration,
    /// Endpoint of last resort for rendered configurations
    pub fallback_endpoint: String,
    /// Role bound when the request does not name one
    pub default_role: RoleRefSpec,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            certificate_requeue: DEFAULT_CERTIFICATE_REQUEUE,
            fallback_endpoint: DEFAULT_FALLBACK_ENDPOINT.to_string(),
            default_role: RoleRefSpec::cluster_role(DEFAULT_CLUSTER_ROLE),
        }
    }
}

impl Settings {
    /// Set the certificate requeue delay
    pub fn certificate_requeue(mut self, delay: Duration) -> Self {
        self.certificate_requeue = delay;
        self
    }

    /// Set the fallback endpoint
    pub fn fallback_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.fallback_endpoint = endpoint.into();
        self
    }

    /// Set the default ClusterRole
    pub fn default_cluster_role(mut self, name: impl Into<String>) -> Self {
        self.default_role = RoleRefSpec::cluster_role(name);
        self
    }
}
