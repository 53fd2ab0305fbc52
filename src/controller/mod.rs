//! Controllers for kubeaccess
//!
//! Two independent loops cooperate only through the API server:
//!
//! - [`reconcile`] drives AccessRequests and watches the signing requests
//!   they create
//! - [`reconcile_signing_request`] approves signing requests marked for
//!   automatic approval
//!
//! An approval written by the second loop is a signing request change, which
//! the first loop's watch maps back to the AccessRequest by label.

mod access_request;
mod signing;

pub use access_request::{
    binding_name, error_policy, reconcile, requester_ref, Context, ContextBuilder, CLIENT_SIGNER,
    KUBECONFIG_KEY, TLS_CRT, TLS_CSR, TLS_KEY,
};
pub use signing::{
    decision_of, is_owned, reconcile_signing_request, signing_error_policy, SigningContext,
    SigningDecision, APPROVAL_MESSAGE, APPROVAL_REASON, MALFORMED_REASON,
};

/// Label carrying the owning AccessRequest's name
pub const FOR_NAME_LABEL: &str = "kubeaccess.dev/for-name";

/// Label carrying the owning AccessRequest's namespace
pub const FOR_NAMESPACE_LABEL: &str = "kubeaccess.dev/for-namespace";

/// Annotation marking a signing request for automatic approval
pub const AUTO_APPROVE_ANNOTATION: &str = "kubeaccess.dev/auto-approve";
