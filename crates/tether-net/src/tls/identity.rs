//! Locally held TLS certificates.

use std::path::Path;
use std::time::{Duration, SystemTime};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::SignatureAlgorithm;
use tether_core::{HeldCredential, KeyType, Principal};
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use zeroize::Zeroizing;

use crate::error::{TransportError, TransportResult};

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_ED25519: &str = "1.3.101.112";

/// A certificate chain with its private key.
///
/// Parsing never fails on an unusable key: such an identity reports
/// `has_private_key() == false` and is skipped at listen time.
pub struct TlsIdentity {
    chain: Vec<CertificateDer<'static>>,
    key_pem: Zeroizing<Vec<u8>>,
    principal: Principal,
    key_type: KeyType,
    not_before: SystemTime,
    not_after: SystemTime,
    has_key: bool,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("principal", &self.principal)
            .field("key_type", &self.key_type)
            .field("has_key", &self.has_key)
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Parses a PEM certificate chain (leaf first) and a PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Certificate`] if the chain is empty or the
    /// leaf cannot be parsed, names no common name, or uses an unsupported
    /// key algorithm.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> TransportResult<Self> {
        let chain = parse_certificates(cert_pem)?;
        let leaf = chain
            .first()
            .ok_or_else(|| TransportError::Certificate("no certificates found".into()))?;
        let facts = LeafFacts::parse(leaf)?;
        let key_pem = Zeroizing::new(key_pem.to_vec());
        let has_key = key_matches(&key_pem, facts.key_type);
        if !has_key {
            debug!(principal = %facts.principal, "private key missing or not matching certificate");
        }
        Ok(Self {
            chain,
            key_pem,
            principal: facts.principal,
            key_type: facts.key_type,
            not_before: facts.not_before,
            not_after: facts.not_after,
            has_key,
        })
    }

    /// Reads the chain and key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if a file cannot be read, otherwise as
    /// [`from_pem`](Self::from_pem).
    pub fn from_files(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = Zeroizing::new(std::fs::read(key_path)?);
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Certificate chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Parses the private key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PrivateKey`] if the key cannot be parsed.
    pub fn private_key(&self) -> TransportResult<PrivateKeyDer<'static>> {
        PrivateKeyDer::from_pem_slice(&self.key_pem)
            .map_err(|e| TransportError::PrivateKey(format!("failed to parse private key: {e}")))
    }

    /// Validity window.
    #[must_use]
    pub const fn validity(&self) -> (SystemTime, SystemTime) {
        (self.not_before, self.not_after)
    }
}

impl HeldCredential for TlsIdentity {
    fn principal(&self) -> &Principal {
        &self.principal
    }

    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn is_valid_at(&self, now: SystemTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    fn has_private_key(&self) -> bool {
        self.has_key
    }
}

/// What the transport reads from a certificate.
pub(crate) struct LeafFacts {
    pub(crate) principal: Principal,
    pub(crate) key_type: KeyType,
    not_before: SystemTime,
    not_after: SystemTime,
}

impl LeafFacts {
    pub(crate) fn parse(der: &CertificateDer<'_>) -> TransportResult<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| TransportError::Certificate(format!("failed to parse certificate: {e}")))?;
        let principal = common_name(&cert)
            .ok_or_else(|| TransportError::Certificate("certificate has no common name".into()))?;
        let key_type = key_type(&cert)?;
        let validity = cert.validity();
        Ok(Self {
            principal,
            key_type,
            not_before: to_system_time(validity.not_before.timestamp()),
            not_after: to_system_time(validity.not_after.timestamp()),
        })
    }
}

fn common_name(cert: &X509Certificate<'_>) -> Option<Principal> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(Principal::new)
}

fn key_type(cert: &X509Certificate<'_>) -> TransportResult<KeyType> {
    let oid = cert.public_key().algorithm.algorithm.to_id_string();
    match oid.as_str() {
        OID_EC_PUBLIC_KEY => Ok(KeyType::Ec),
        OID_RSA_ENCRYPTION => Ok(KeyType::Rsa),
        OID_ED25519 => Ok(KeyType::Ed25519),
        other => Err(TransportError::Certificate(format!(
            "unsupported public key algorithm {other}"
        ))),
    }
}

fn to_system_time(timestamp: i64) -> SystemTime {
    let magnitude = Duration::from_secs(timestamp.unsigned_abs());
    if timestamp >= 0 {
        SystemTime::UNIX_EPOCH + magnitude
    } else {
        SystemTime::UNIX_EPOCH - magnitude
    }
}

fn key_matches(key_pem: &[u8], key_type: KeyType) -> bool {
    let Ok(key) = PrivateKeyDer::from_pem_slice(key_pem) else {
        return false;
    };
    let Ok(signing_key) = rustls::crypto::ring::sign::any_supported_type(&key) else {
        return false;
    };
    matches!(
        (signing_key.algorithm(), key_type),
        (SignatureAlgorithm::ECDSA, KeyType::Ec)
            | (SignatureAlgorithm::RSA, KeyType::Rsa)
            | (SignatureAlgorithm::ED25519, KeyType::Ed25519)
    )
}

/// Parses PEM-encoded certificates.
pub(crate) fn parse_certificates(pem: &[u8]) -> TransportResult<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("failed to parse certificates: {e}")))
}
