//! Rendered access configuration (kubeconfig) documents
//!
//! In memory, clusters, contexts and users are name-keyed maps. The
//! `{name, <kind>}` list form kubectl reads exists only at the
//! [`encode`]/[`decode`] boundary.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize};

use crate::Error;

/// `apiVersion` of every rendered document
pub const API_VERSION: &str = "v1";

/// `kind` of every rendered document
pub const KIND: &str = "Config";

/// Namespace selected by the generated context
pub const DEFAULT_CONTEXT_NAMESPACE: &str = "default";

/// A kubeconfig document
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Kubeconfig {
    /// Free-form client preferences
    pub preferences: BTreeMap<String, serde_yaml::Value>,
    /// Name of the context kubectl uses by default
    pub current_context: String,
    /// Cluster entries by name
    pub clusters: BTreeMap<String, ClusterConfig>,
    /// Context entries by name
    pub contexts: BTreeMap<String, ContextConfig>,
    /// User entries by name
    pub users: BTreeMap<String, UserConfig>,
}

/// Cluster configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    #[serde(default)]
    pub server: String,
    /// CA certificate (base64 encoded)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_authority_data: String,
}

/// Context configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    #[serde(default)]
    pub cluster: String,
    /// Default namespace for this context
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// User name (reference)
    #[serde(default)]
    pub user: String,
}

/// User configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_certificate_data: String,
    /// Client private key (base64 encoded)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_key_data: String,
}

/// Everything needed to render a single-user document
#[derive(Clone, Copy, Debug)]
pub struct Credentials<'a> {
    /// CA certificate PEM of the API server
    pub trust_anchor: &'a [u8],
    /// Signed client certificate PEM
    pub certificate: &'a [u8],
    /// Client private key PEM
    pub private_key: &'a [u8],
    /// Display name of the cluster entry
    pub cluster_name: &'a str,
    /// API server URL
    pub server: &'a str,
    /// Identity the certificate was issued to
    pub username: &'a str,
}

/// Build a document with one cluster, one user and one current context
///
/// Deterministic in its inputs.
pub fn assemble(credentials: &Credentials<'_>) -> Kubeconfig {
    let context_name = context_name(credentials.username, credentials.cluster_name);

    let mut config = Kubeconfig {
        current_context: context_name.clone(),
        ..Default::default()
    };

    config.clusters.insert(
        credentials.cluster_name.to_string(),
        ClusterConfig {
            server: credentials.server.to_string(),
            certificate_authority_data: STANDARD.encode(credentials.trust_anchor),
        },
    );
    config.users.insert(
        credentials.username.to_string(),
        UserConfig {
            client_certificate_data: STANDARD.encode(credentials.certificate),
            client_key_data: STANDARD.encode(credentials.private_key),
        },
    );
    config.contexts.insert(
        context_name,
        ContextConfig {
            cluster: credentials.cluster_name.to_string(),
            namespace: DEFAULT_CONTEXT_NAMESPACE.to_string(),
            user: credentials.username.to_string(),
        },
    );

    config
}

/// Context name for a user on a cluster (`user@cluster`)
pub fn context_name(username: &str, cluster_name: &str) -> String {
    format!("{}@{}", username, cluster_name)
}

impl Kubeconfig {
    /// Server URL of the named cluster, or of the only cluster present
    ///
    /// The public `cluster-info` document names its single cluster `""`,
    /// so an empty name also matches a lone entry.
    pub fn server_for(&self, cluster_name: &str) -> Option<&str> {
        let cluster = match self.clusters.get(cluster_name) {
            Some(c) => Some(c),
            None if self.clusters.len() == 1 => self.clusters.values().next(),
            None => None,
        };
        cluster
            .map(|c| c.server.as_str())
            .filter(|server| !server.is_empty())
    }
}

// ===== Textual encoding =====

#[derive(Serialize, Deserialize)]
struct Document {
    #[serde(rename = "apiVersion", default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    preferences: BTreeMap<String, serde_yaml::Value>,
    #[serde(rename = "current-context", default)]
    current_context: String,
    #[serde(default, deserialize_with = "null_as_default")]
    clusters: Vec<NamedCluster>,
    #[serde(default, deserialize_with = "null_as_default")]
    contexts: Vec<NamedContext>,
    #[serde(default, deserialize_with = "null_as_default")]
    users: Vec<NamedUser>,
}

#[derive(Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    #[serde(default)]
    cluster: ClusterConfig,
}

#[derive(Serialize, Deserialize)]
struct NamedContext {
    name: String,
    #[serde(default)]
    context: ContextConfig,
}

#[derive(Serialize, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserConfig,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Serialize a document to YAML
pub fn encode(config: &Kubeconfig) -> Result<String, Error> {
    let document = Document {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        preferences: config.preferences.clone(),
        current_context: config.current_context.clone(),
        clusters: config
            .clusters
            .iter()
            .map(|(name, cluster)| NamedCluster {
                name: name.clone(),
                cluster: cluster.clone(),
            })
            .collect(),
        contexts: config
            .contexts
            .iter()
            .map(|(name, context)| NamedContext {
                name: name.clone(),
                context: context.clone(),
            })
            .collect(),
        users: config
            .users
            .iter()
            .map(|(name, user)| NamedUser {
                name: name.clone(),
                user: user.clone(),
            })
            .collect(),
    };

    serde_yaml::to_string(&document)
        .map_err(|e| Error::kubeconfig(format!("failed to encode kubeconfig: {}", e)))
}

/// Parse a YAML (or JSON) document
///
/// Later list entries win over earlier ones with the same name.
pub fn decode(text: &str) -> Result<Kubeconfig, Error> {
    let document: Document = serde_yaml::from_str(text)
        .map_err(|e| Error::kubeconfig(format!("failed to decode kubeconfig: {}", e)))?;

    if !document.kind.is_empty() && document.kind != KIND {
        return Err(Error::kubeconfig(format!(
            "expected kind {KIND}, found {}",
            document.kind
        )));
    }

    Ok(Kubeconfig {
        preferences: document.preferences,
        current_context: document.current_context,
        clusters: document
            .clusters
            .into_iter()
            .map(|c| (c.name, c.cluster))
            .collect(),
        contexts: document
            .contexts
            .into_iter()
            .map(|c| (c.name, c.context))
            .collect(),
        users: document
            .users
            .into_iter()
            .map(|u| (u.name, u.user))
            .collect(),
    })
}
