//! Test doubles for the object store and the cluster signer
//!
//! [`FakeApiServer`] keeps objects as JSON, enforces resourceVersion checks
//! like the real API server and counts every mutating call.
//! [`TestSigner`] issues real client certificates for signing requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use serde_json::Value;

use crate::store::{ObjectKey, ObjectStore, StoreResource, Subresource};
use crate::Error;

type StoredKey = (String, ObjectKey);

/// In-memory API server
#[derive(Default)]
pub struct FakeApiServer {
    objects: Mutex<BTreeMap<StoredKey, Value>>,
    calls: Mutex<HashMap<(String, &'static str), usize>>,
    next_uid: Mutex<u64>,
}

impl FakeApiServer {
    /// Create an empty server
    pub fn new() -> Self {
        Self::default()
    }

    fn count(&self, kind: &str, op: &'static str) {
        *self
            .calls
            .lock()
            .unwrap()
            .entry((kind.to_string(), op))
            .or_default() += 1;
    }

    fn calls(&self, kind: &str, op: &'static str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&(kind.to_string(), op))
            .copied()
            .unwrap_or_default()
    }

    /// Number of creates for a kind
    pub fn creates(&self, kind: &str) -> usize {
        self.calls(kind, "create")
    }

    /// Number of replaces and subresource writes for a kind
    pub fn updates(&self, kind: &str) -> usize {
        self.calls(kind, "update")
    }

    /// Total number of mutating calls across all kinds
    pub fn mutations(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Read an object without going through the store interface
    pub fn fetch<K: StoreResource>(&self, key: &ObjectKey) -> Option<K> {
        let kind = K::kind(&()).to_string();
        self.objects
            .lock()
            .unwrap()
            .get(&(kind, key.clone()))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Seed an object without counting it as a mutation
    pub fn seed<K: StoreResource>(&self, obj: K) -> K {
        let kind = K::kind(&()).to_string();
        let mut value = serde_json::to_value(&obj).unwrap();
        self.stamp(&mut value, None);
        self.objects
            .lock()
            .unwrap()
            .insert((kind, ObjectKey::of(&obj)), value.clone());
        serde_json::from_value(value).unwrap()
    }

    /// Delete an object, as garbage collection or CSR cleanup would
    pub fn remove<K: StoreResource>(&self, key: &ObjectKey) {
        let kind = K::kind(&()).to_string();
        self.objects.lock().unwrap().remove(&(kind, key.clone()));
    }

    /// Populate `status.certificate` of a signing request, as the signer would
    pub fn issue_certificate(&self, name: &str, certificate: &[u8]) {
        self.edit_status::<CertificateSigningRequest>(&ObjectKey::cluster(name), |csr| {
            csr.status.get_or_insert_with(Default::default).certificate =
                Some(ByteString(certificate.to_vec()));
        });
    }

    /// Add a condition to a signing request, as an administrator would
    pub fn add_signing_condition(&self, name: &str, type_: &str) {
        self.edit_status::<CertificateSigningRequest>(&ObjectKey::cluster(name), |csr| {
            csr.status
                .get_or_insert_with(Default::default)
                .conditions
                .get_or_insert_with(Vec::new)
                .push(CertificateSigningRequestCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    reason: Some("Manual".to_string()),
                    ..Default::default()
                });
        });
    }

    fn edit_status<K: StoreResource>(&self, key: &ObjectKey, edit: impl FnOnce(&mut K)) {
        let mut obj: K = self.fetch(key).unwrap();
        edit(&mut obj);
        let kind = K::kind(&()).to_string();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get_mut(&(kind, key.clone())).unwrap();
        let new = serde_json::to_value(&obj).unwrap();
        stored["status"] = new["status"].clone();
        bump(stored);
    }

    fn stamp(&self, value: &mut Value, previous: Option<&Value>) {
        let metadata = &mut value["metadata"];
        if metadata.get("uid").map_or(true, Value::is_null) {
            let mut next = self.next_uid.lock().unwrap();
            *next += 1;
            metadata["uid"] = Value::String(format!("uid-{}", *next));
        }
        let version = previous.map(resource_version).unwrap_or(0) + 1;
        metadata["resourceVersion"] = Value::String(version.to_string());
    }

    fn check_version(stored: &Value, incoming: &Value, kind: &str, name: &str) -> Result<(), Error> {
        match incoming["metadata"].get("resourceVersion").and_then(Value::as_str) {
            Some(v) if v != stored["metadata"]["resourceVersion"].as_str().unwrap_or_default() => {
                Err(Error::conflict(kind, name))
            }
            _ => Ok(()),
        }
    }
}

fn resource_version(value: &Value) -> u64 {
    value["metadata"]["resourceVersion"]
        .as_str()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn bump(value: &mut Value) {
    let next = resource_version(value) + 1;
    value["metadata"]["resourceVersion"] = Value::String(next.to_string());
}

/// Kinds whose main endpoint ignores status, like CRDs with a status subresource
fn has_status_subresource(kind: &str) -> bool {
    matches!(kind, "AccessRequest" | "CertificateSigningRequest")
}

#[async_trait]
impl<K: StoreResource> ObjectStore<K> for FakeApiServer {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        Ok(self.fetch(key))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let kind = K::kind(&()).to_string();
        let key = ObjectKey::of(obj);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&(kind.clone(), key.clone())) {
            return Err(Error::already_exists(kind, obj.name_any()));
        }

        let mut value = serde_json::to_value(obj)?;
        self.stamp(&mut value, None);
        objects.insert((kind.clone(), key), value.clone());
        drop(objects);

        self.count(&kind, "create");
        Ok(serde_json::from_value(value)?)
    }

    async fn replace(&self, obj: &K) -> Result<K, Error> {
        let kind = K::kind(&()).to_string();
        let key = ObjectKey::of(obj);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&(kind.clone(), key.clone()))
            .ok_or_else(|| Error::missing_data(format!("{kind} {key} not found")))?;

        let mut value = serde_json::to_value(obj)?;
        Self::check_version(stored, &value, &kind, &key.name)?;
        if has_status_subresource(&kind) {
            value["status"] = stored["status"].clone();
        }
        value["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        value["metadata"]["resourceVersion"] = stored["metadata"]["resourceVersion"].clone();
        bump(&mut value);
        *stored = value.clone();
        drop(objects);

        self.count(&kind, "update");
        Ok(serde_json::from_value(value)?)
    }

    async fn replace_subresource(&self, subresource: Subresource, obj: &K) -> Result<K, Error> {
        let kind = K::kind(&()).to_string();
        let key = ObjectKey::of(obj);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&(kind.clone(), key.clone()))
            .ok_or_else(|| Error::missing_data(format!("{kind} {key} not found")))?;

        let value = serde_json::to_value(obj)?;
        Self::check_version(stored, &value, &kind, &key.name)?;
        match subresource {
            Subresource::Status => stored["status"] = value["status"].clone(),
            Subresource::Approval => {
                stored["status"]["conditions"] = value["status"]["conditions"].clone()
            }
        }
        bump(stored);
        let result = stored.clone();
        drop(objects);

        self.count(&kind, "update");
        Ok(serde_json::from_value(result)?)
    }
}

/// Certificate authority standing in for the cluster signer
pub struct TestSigner {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl TestSigner {
    /// Create a new self-signed CA
    pub fn new() -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("kubernetes".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        }
    }

    /// CA certificate PEM (the cluster trust anchor)
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Sign a signing request for client authentication
    pub fn sign(&self, csr_pem: &str) -> String {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let ca_key = KeyPair::from_pem(&self.ca_key_pem).unwrap();
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key).unwrap();
        csr_params.signed_by(&issuer).unwrap().pem()
    }
}
