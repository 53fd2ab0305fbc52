//! Custom Resource Definitions for kubeaccess
//!
//! This module contains the AccessRequest CRD and its supporting types.

mod access_request;
mod types;

pub use access_request::{AccessRequest, AccessRequestSpec, AccessRequestStatus};
pub use types::{
    set_condition, AccessPhase, ClusterSpec, Condition, ConditionStatus, ConditionType, CsrSpec,
    RoleRefSpec, SignatureAlgorithm, SubjectFields, CLUSTER_ROLE_KIND, DEFAULT_CLUSTER_NAME,
    RBAC_API_GROUP,
};
