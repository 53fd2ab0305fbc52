//! Key and certificate signing request generation
//!
//! Material is generated locally and only the signing request ever leaves
//! the operator. The private key is stored in the user's secret next to the
//! certificate the cluster signer eventually issues for it.
//!
//! # Supported algorithms
//!
//! - RSA PKCS#1 v1.5 with SHA-256/384/512 (2048, 3072 or 4096 bit keys)
//! - ECDSA on P-256, P-384 and P-521
//! - Ed25519
//!
//! RSA-PSS selectors are rejected. There is no fallback: defaulting happens
//! in the CRD schema, not here.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, RsaKeySize,
    SignatureAlgorithm as KeyAlgorithm, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384,
    PKCS_ECDSA_P521_SHA512, PKCS_ED25519, PKCS_RSA_SHA256, PKCS_RSA_SHA384, PKCS_RSA_SHA512,
};
use thiserror::Error;
use x509_parser::prelude::*;

use crate::crd::{CsrSpec, SignatureAlgorithm, SubjectFields};

/// PEM label of a certificate signing request
pub const CSR_PEM_TAG: &str = "CERTIFICATE REQUEST";

/// RSA modulus size used when the request does not pick one
pub const DEFAULT_RSA_KEY_SIZE: u32 = 4096;

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// The signature algorithm selector cannot be generated
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The RSA key size is not one of 2048, 3072, 4096
    #[error("unsupported RSA key size: {0}")]
    UnsupportedKeySize(u32),

    /// Subject fields cannot be encoded
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Signing request generation failed
    #[error("signing request generation failed: {0}")]
    RequestGenerationFailed(String),

    /// Signing request or key could not be parsed
    #[error("parse error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Public key algorithm family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyFamily {
    /// RSA keys
    Rsa,
    /// Elliptic curve keys used with ECDSA
    Ecdsa,
    /// Ed25519 keys
    Ed25519,
}

impl KeyFamily {
    /// Family of a SubjectPublicKeyInfo algorithm OID
    pub fn from_key_oid(oid: &str) -> Option<Self> {
        match oid {
            OID_RSA_ENCRYPTION => Some(Self::Rsa),
            OID_EC_PUBLIC_KEY => Some(Self::Ecdsa),
            OID_ED25519 => Some(Self::Ed25519),
            _ => None,
        }
    }

    /// Family of a signature algorithm OID
    pub fn from_signature_oid(oid: &str) -> Option<Self> {
        if oid.starts_with("1.2.840.113549.1.1.") {
            Some(Self::Rsa)
        } else if oid.starts_with("1.2.840.10045.4.3.") {
            Some(Self::Ecdsa)
        } else if oid == OID_ED25519 {
            Some(Self::Ed25519)
        } else {
            None
        }
    }
}

/// A private key and the signing request bound to it
#[derive(Clone, Debug)]
pub struct CredentialMaterial {
    key_pem: String,
    csr_pem: String,
}

impl CredentialMaterial {
    /// Generate a new key pair and signing request
    ///
    /// The identity becomes the Common Name; the request's subject fields fill
    /// the remaining attributes.
    pub fn generate(common_name: &str, csr: &CsrSpec) -> Result<Self> {
        let algorithm = key_algorithm(csr.signature_algorithm)?;

        let key_pair = if is_rsa(csr.signature_algorithm) {
            let size = rsa_key_size(csr.rsa_key_size.unwrap_or(DEFAULT_RSA_KEY_SIZE))?;
            KeyPair::generate_rsa_for(algorithm, size)
        } else {
            KeyPair::generate_for(algorithm)
        }
        .map_err(|e| {
            PkiError::KeyGenerationFailed(format!(
                "failed to generate {} key: {}",
                csr.signature_algorithm, e
            ))
        })?;

        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, &csr.fields)?;

        let request = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::RequestGenerationFailed(format!("failed to create CSR: {}", e))
        })?;

        let csr_pem = request.pem().map_err(|e| {
            PkiError::RequestGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        let parsed = parse_signing_request(csr_pem.as_bytes())?;
        debug_assert_eq!(
            parsed.signature_family(),
            parsed.key_family(),
            "signing request signature does not match its key"
        );

        Ok(Self { key_pem, csr_pem })
    }

    /// Wrap material supplied by the user
    ///
    /// The request must parse; the key must at least be PEM.
    pub fn from_pem(key_pem: impl Into<String>, csr_pem: impl Into<String>) -> Result<Self> {
        let key_pem = key_pem.into();
        let csr_pem = csr_pem.into();

        ::pem::parse(key_pem.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))?;
        parse_signing_request(csr_pem.as_bytes())?;

        Ok(Self { key_pem, csr_pem })
    }

    /// The signing request in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// The private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Fields extracted from a parsed signing request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Subject Common Name, if present
    pub common_name: Option<String>,
    /// Dotted OID of the request's signature algorithm
    pub signature_oid: String,
    /// Dotted OID of the public key algorithm
    pub key_oid: String,
}

impl ParsedRequest {
    /// Family of the embedded public key
    pub fn key_family(&self) -> Option<KeyFamily> {
        KeyFamily::from_key_oid(&self.key_oid)
    }

    /// Family of the signature over the request
    pub fn signature_family(&self) -> Option<KeyFamily> {
        KeyFamily::from_signature_oid(&self.signature_oid)
    }
}

/// Decode a PEM signing request and parse its DER body
pub fn parse_signing_request(pem_data: &[u8]) -> Result<ParsedRequest> {
    let pem_obj = ::pem::parse(pem_data)
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;

    if pem_obj.tag() != CSR_PEM_TAG {
        return Err(PkiError::ParseError(format!(
            "expected PEM block {:?}, found {:?}",
            CSR_PEM_TAG,
            pem_obj.tag()
        )));
    }

    let (_, request) = X509CertificationRequest::from_der(pem_obj.contents())
        .map_err(|e| PkiError::ParseError(format!("failed to parse CSR: {}", e)))?;

    let info = &request.certification_request_info;
    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    Ok(ParsedRequest {
        common_name,
        signature_oid: request.signature_algorithm.algorithm.to_id_string(),
        key_oid: info.subject_pki.algorithm.algorithm.to_id_string(),
    })
}

fn is_rsa(algorithm: SignatureAlgorithm) -> bool {
    matches!(
        algorithm,
        SignatureAlgorithm::Sha256WithRsa
            | SignatureAlgorithm::Sha384WithRsa
            | SignatureAlgorithm::Sha512WithRsa
    )
}

fn key_algorithm(algorithm: SignatureAlgorithm) -> Result<&'static KeyAlgorithm> {
    match algorithm {
        SignatureAlgorithm::Sha256WithRsa => Ok(&PKCS_RSA_SHA256),
        SignatureAlgorithm::Sha384WithRsa => Ok(&PKCS_RSA_SHA384),
        SignatureAlgorithm::Sha512WithRsa => Ok(&PKCS_RSA_SHA512),
        SignatureAlgorithm::EcdsaWithSha256 => Ok(&PKCS_ECDSA_P256_SHA256),
        SignatureAlgorithm::EcdsaWithSha384 => Ok(&PKCS_ECDSA_P384_SHA384),
        SignatureAlgorithm::EcdsaWithSha512 => Ok(&PKCS_ECDSA_P521_SHA512),
        SignatureAlgorithm::PureEd25519 => Ok(&PKCS_ED25519),
        other => Err(PkiError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn rsa_key_size(bits: u32) -> Result<RsaKeySize> {
    match bits {
        2048 => Ok(RsaKeySize::_2048),
        3072 => Ok(RsaKeySize::_3072),
        4096 => Ok(RsaKeySize::_4096),
        other => Err(PkiError::UnsupportedKeySize(other)),
    }
}

fn distinguished_name(common_name: &str, fields: &SubjectFields) -> Result<DistinguishedName> {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );

    let attributes = [
        (DnType::CountryName, "country", &fields.country),
        (DnType::StateOrProvinceName, "province", &fields.province),
        (DnType::LocalityName, "locality", &fields.locality),
        (DnType::OrganizationName, "organization", &fields.organization),
        (
            DnType::OrganizationalUnitName,
            "organizationalUnit",
            &fields.organizational_unit,
        ),
    ];

    for (dn_type, field, values) in attributes {
        let values: Vec<&String> = values.iter().filter(|v| !v.is_empty()).collect();
        match values.as_slice() {
            [] => {}
            [value] => dn.push(dn_type, DnValue::Utf8String((*value).clone())),
            _ => {
                return Err(PkiError::InvalidSubject(format!(
                    "{field} has {} values, only one is supported",
                    values.len()
                )))
            }
        }
    }

    Ok(dn)
}
