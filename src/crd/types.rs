//! Supporting types for the AccessRequest CRD

use chrono::{DateTime, Utc};
use k8s_openapi::api::rbac::v1::RoleRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for RBAC role references
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// The only role kind a ClusterRoleBinding can reference
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";

/// Cluster display name used when the request leaves it empty
pub const DEFAULT_CLUSTER_NAME: &str = "kubernetes";

/// Signature algorithm used for the generated key and signing request
///
/// The RSA-PSS selectors are accepted by the schema so existing manifests
/// still apply, but key generation rejects them.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SignatureAlgorithm {
    /// RSA PKCS#1 v1.5 with SHA-256
    #[default]
    #[serde(rename = "SHA256WithRSA")]
    Sha256WithRsa,
    /// RSA PKCS#1 v1.5 with SHA-384
    #[serde(rename = "SHA384WithRSA")]
    Sha384WithRsa,
    /// RSA PKCS#1 v1.5 with SHA-512
    #[serde(rename = "SHA512WithRSA")]
    Sha512WithRsa,
    /// ECDSA on P-256 with SHA-256
    #[serde(rename = "ECDSAWithSHA256")]
    EcdsaWithSha256,
    /// ECDSA on P-384 with SHA-384
    #[serde(rename = "ECDSAWithSHA384")]
    EcdsaWithSha384,
    /// ECDSA on P-521 with SHA-512
    #[serde(rename = "ECDSAWithSHA512")]
    EcdsaWithSha512,
    /// RSA-PSS with SHA-256
    #[serde(rename = "SHA256WithRSAPSS")]
    Sha256WithRsaPss,
    /// RSA-PSS with SHA-384
    #[serde(rename = "SHA384WithRSAPSS")]
    Sha384WithRsaPss,
    /// RSA-PSS with SHA-512
    #[serde(rename = "SHA512WithRSAPSS")]
    Sha512WithRsaPss,
    /// Ed25519
    #[serde(rename = "PureEd25519")]
    PureEd25519,
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sha256WithRsa => "SHA256WithRSA",
            Self::Sha384WithRsa => "SHA384WithRSA",
            Self::Sha512WithRsa => "SHA512WithRSA",
            Self::EcdsaWithSha256 => "ECDSAWithSHA256",
            Self::EcdsaWithSha384 => "ECDSAWithSHA384",
            Self::EcdsaWithSha512 => "ECDSAWithSHA512",
            Self::Sha256WithRsaPss => "SHA256WithRSAPSS",
            Self::Sha384WithRsaPss => "SHA384WithRSAPSS",
            Self::Sha512WithRsaPss => "SHA512WithRSAPSS",
            Self::PureEd25519 => "PureEd25519",
        };
        write!(f, "{name}")
    }
}

/// Subject attributes placed next to the Common Name in the signing request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectFields {
    /// Country (C)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub country: Vec<String>,
    /// State or province (ST)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub province: Vec<String>,
    /// Locality (L)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locality: Vec<String>,
    /// Organization (O), which Kubernetes maps to groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,
    /// Organizational unit (OU)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizational_unit: Vec<String>,
}

impl SubjectFields {
    /// Returns true if no attribute is set
    pub fn is_empty(&self) -> bool {
        self.country.is_empty()
            && self.province.is_empty()
            && self.locality.is_empty()
            && self.organization.is_empty()
            && self.organizational_unit.is_empty()
    }
}

/// Signing parameters for generated material
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CsrSpec {
    /// Signature algorithm for the key and request
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,

    /// RSA modulus size in bits (2048, 3072 or 4096); ignored for non-RSA keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_key_size: Option<u32>,

    /// Subject attributes besides the Common Name
    #[serde(default, skip_serializing_if = "SubjectFields::is_empty")]
    pub fields: SubjectFields,
}

/// Target cluster as it appears in the rendered configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Display name of the cluster entry
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// API server endpoint; discovered from the cluster when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            server: String::new(),
        }
    }
}

/// Role granted to the requested identity
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRefSpec {
    /// API group of the role
    #[serde(default = "rbac_api_group")]
    pub api_group: String,
    /// Role kind; must be ClusterRole
    pub kind: String,
    /// Role name
    pub name: String,
}

fn rbac_api_group() -> String {
    RBAC_API_GROUP.to_string()
}

impl RoleRefSpec {
    /// Reference to a ClusterRole
    pub fn cluster_role(name: impl Into<String>) -> Self {
        Self {
            api_group: rbac_api_group(),
            kind: CLUSTER_ROLE_KIND.to_string(),
            name: name.into(),
        }
    }
}

impl From<&RoleRefSpec> for RoleRef {
    fn from(spec: &RoleRefSpec) -> Self {
        RoleRef {
            api_group: spec.api_group.clone(),
            kind: spec.kind.clone(),
            name: spec.name.clone(),
        }
    }
}

/// AccessRequest lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum AccessPhase {
    /// Nothing has been submitted yet
    #[default]
    Pending,
    /// The signing request exists and waits for a decision and certificate
    AwaitingApproval,
    /// Credentials are rendered and bound
    Finished,
    /// Provisioning stopped and needs a spec change
    Failed,
}

impl std::fmt::Display for AccessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::AwaitingApproval => write!(f, "AwaitingApproval"),
            Self::Finished => write!(f, "Finished"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition types recorded on an AccessRequest
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// The signing request was submitted
    SigningRequestCreated,
    /// A decision on the signing request was observed
    SigningRequestApproved,
    /// The user secret exists
    UserSecretCreated,
    /// The user secret holds the certificate and rendered document
    UserSecretFinished,
    /// The rendered-config secret exists
    KubeconfigSecretCreated,
    /// Provisioning reached a terminal state
    Finished,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SigningRequestCreated => "SigningRequestCreated",
            Self::SigningRequestApproved => "SigningRequestApproved",
            Self::UserSecretCreated => "UserSecretCreated",
            Self::UserSecretFinished => "UserSecretFinished",
            Self::KubeconfigSecretCreated => "KubeconfigSecretCreated",
            Self::Finished => "Finished",
        };
        write!(f, "{name}")
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or update a condition, keeping at most one entry per type
///
/// Reason and message always take the new values. The transition time only
/// moves when the status value actually changes, so repeated reconciles of
/// the same state leave the list byte-identical.
pub fn set_condition(
    mut conditions: Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
) -> Vec<Condition> {
    let incoming = Condition::new(type_, status, reason, message);

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != incoming.status {
                existing.last_transition_time = incoming.last_transition_time;
            }
            existing.status = incoming.status;
            existing.reason = incoming.reason;
            existing.message = incoming.message;
        }
        None => conditions.push(incoming),
    }

    // Lists written by older revisions may carry duplicates; keep the first.
    let mut seen = std::collections::HashSet::new();
    conditions.retain(|c| seen.insert(c.type_));
    conditions
}
