//! Error types for the kubeaccess operator

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for kubeaccess operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// An update lost an optimistic-concurrency race
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
    },

    /// A create found an object with the same key
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the object being created
        kind: String,
        /// Name of the object being created
        name: String,
    },

    /// Key or signing request generation/parsing failed
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Access configuration document could not be encoded or decoded
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Validation error for AccessRequest specs
    #[error("validation error: {0}")]
    Validation(String),

    /// An object or field the reconcile depends on is not there (yet)
    #[error("missing data: {0}")]
    MissingData(String),
}

impl Error {
    /// Create a conflict error for the given kind and name
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for the given kind and name
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a missing-data error with the given message
    pub fn missing_data(msg: impl Into<String>) -> Self {
        Self::MissingData(msg.into())
    }

    /// Returns true if retrying cannot fix this error without a spec change
    ///
    /// Terminal errors are surfaced on the AccessRequest as a Failed phase;
    /// everything else goes back to the work queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Pki(_) | Self::Validation(_))
    }

    /// Returns true if this error is a lost optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Stable, machine-readable reason code for status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube(_) => "KubernetesError",
            Self::Conflict { .. } => "Conflict",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Pki(_) => "GenerationFailed",
            Self::Kubeconfig(_) => "KubeconfigError",
            Self::Serialization(_) => "SerializationError",
            Self::Validation(_) => "InvalidSpec",
            Self::MissingData(_) => "MissingData",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
