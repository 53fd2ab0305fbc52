//! AccessRequest Custom Resource Definition
//!
//! An AccessRequest asks for a client certificate for one identity on one
//! cluster, rendered into a ready-to-use kubeconfig and bound to a role.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{
    set_condition, AccessPhase, ClusterSpec, Condition, ConditionStatus, ConditionType, CsrSpec,
    RoleRefSpec, CLUSTER_ROLE_KIND, RBAC_API_GROUP,
};

/// Longest name the API server accepts for an object
const MAX_OBJECT_NAME_LEN: usize = 253;

/// Hex digits of digest kept when a derived name is truncated
const DIGEST_SUFFIX_LEN: usize = 10;

/// Specification for an AccessRequest
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubeaccess.dev",
    version = "v1alpha1",
    kind = "AccessRequest",
    plural = "accessrequests",
    shortname = "ar",
    status = "AccessRequestStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestSpec {
    /// Identity placed in the certificate Common Name and the role binding
    pub username: String,

    /// Secret in the same namespace holding `tls.key` and `tls.csr` to use
    /// instead of generating new material
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_secret: Option<String>,

    /// Mark the signing request for automatic approval
    #[serde(default)]
    pub auto_approve: bool,

    /// Parameters for generated key material
    #[serde(default)]
    pub csr: CsrSpec,

    /// Cluster entry written into the rendered configuration
    #[serde(default)]
    pub cluster: ClusterSpec,

    /// Role bound to the identity (defaults to cluster-admin)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_ref: Option<RoleRefSpec>,
}

impl AccessRequestSpec {
    /// Validate the request specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.username.trim().is_empty() {
            return Err(crate::Error::validation("username must not be empty"));
        }

        if self.cluster.name.trim().is_empty() {
            return Err(crate::Error::validation("cluster name must not be empty"));
        }

        if let Some(existing) = &self.existing_secret {
            if existing.is_empty() {
                return Err(crate::Error::validation(
                    "existingSecret must name a secret when set",
                ));
            }
            if !self.csr.fields.is_empty() {
                return Err(crate::Error::validation(
                    "existingSecret and csr.fields are mutually exclusive",
                ));
            }
        }

        if let Some(role) = &self.role_ref {
            if role.name.is_empty() {
                return Err(crate::Error::validation("roleRef.name must not be empty"));
            }
            // Bound through a ClusterRoleBinding, which can only reference a ClusterRole
            if role.kind != CLUSTER_ROLE_KIND || role.api_group != RBAC_API_GROUP {
                return Err(crate::Error::validation(format!(
                    "roleRef must be a {CLUSTER_ROLE_KIND} in {RBAC_API_GROUP}, got {} in {:?}",
                    role.kind, role.api_group
                )));
            }
        }

        Ok(())
    }

    /// Check that an update only touches mutable fields
    ///
    /// Identity and key material are fixed once admitted; the signing
    /// request already in flight was built from them.
    pub fn validate_update(&self, previous: &Self) -> Result<(), crate::Error> {
        if self.username != previous.username {
            return Err(crate::Error::validation("username is immutable"));
        }
        if self.existing_secret != previous.existing_secret {
            return Err(crate::Error::validation("existingSecret is immutable"));
        }
        if self.csr != previous.csr {
            return Err(crate::Error::validation("csr is immutable"));
        }
        Ok(())
    }
}

/// Status for an AccessRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestStatus {
    /// Current phase of the request lifecycle
    #[serde(default)]
    pub phase: AccessPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Name of the secret holding key, request, certificate and document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_secret: Option<String>,

    /// Name of the cluster-scoped signing request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_request: Option<String>,

    /// Name of the secret holding only the rendered document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret: Option<String>,

    /// Rendered access configuration document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

impl AccessRequestStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: AccessPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: AccessPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Record a condition and return self for chaining
    pub fn condition(
        mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.conditions = set_condition(self.conditions, type_, status, reason, message);
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Returns true if the condition exists with status True
    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get_condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Returns true once provisioning has settled, successfully or not
    pub fn is_terminal(&self) -> bool {
        self.get_condition(ConditionType::Finished)
            .is_some_and(|c| c.status != ConditionStatus::Unknown)
    }
}

impl AccessRequest {
    /// Current status, or an empty Pending status
    pub fn status_or_default(&self) -> AccessRequestStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Name of the cluster-scoped signing request for this request
    ///
    /// `<namespace>.<name>`: namespaces cannot contain dots, so distinct
    /// requests never share a name. Names past the object-name limit are
    /// truncated and suffixed with a digest of `namespace/name`.
    pub fn signing_request_name(&self) -> String {
        let namespace = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let full = format!("{namespace}.{name}");
        if full.len() <= MAX_OBJECT_NAME_LEN {
            return full;
        }

        let digest = Sha256::digest(format!("{namespace}/{name}").as_bytes());
        let suffix: String = format!("{digest:x}").chars().take(DIGEST_SUFFIX_LEN).collect();
        let keep = MAX_OBJECT_NAME_LEN - DIGEST_SUFFIX_LEN - 1;
        let prefix: String = full.chars().take(keep).collect();
        format!("{}-{suffix}", prefix.trim_end_matches(['.', '-']))
    }

    /// Name of the secret holding key, request, certificate and document
    pub fn user_secret_name(&self) -> String {
        format!("{}-user", self.name_any())
    }

    /// Name of the secret holding the rendered document
    pub fn kubeconfig_secret_name(&self) -> String {
        format!("{}-kubeconfig", self.name_any())
    }
}
