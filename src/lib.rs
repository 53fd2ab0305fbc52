//! kubeaccess - per-user cluster access credentials as a Kubernetes operator
//!
//! An `AccessRequest` names an identity. The operator generates a key and a
//! certificate signing request, submits it to the cluster signer, waits for
//! a decision, renders a kubeconfig from the issued certificate and binds the
//! identity to a role.
//!
//! # Architecture
//!
//! Two controllers share nothing but the API server:
//! - the AccessRequest controller owns the provisioning state machine
//! - the approval watcher approves signing requests marked for automatic
//!   approval
//!
//! # Modules
//!
//! - [`crd`] - AccessRequest resource, phases and conditions
//! - [`controller`] - Both reconcilers and their contexts
//! - [`pki`] - Key and signing request generation and parsing
//! - [`kubeconfig`] - Rendered access configuration and its YAML encoding
//! - [`store`] - Object store seam and the idempotent `ensure` upsert
//! - [`bootstrap`] - Cluster CA and API endpoint discovery
//! - [`config`] - Runtime settings
//! - [`telemetry`] - Tracing setup
//! - [`retry`] - Bounded retry of transient failures for startup calls
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod kubeconfig;
pub mod pki;
pub mod retry;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
