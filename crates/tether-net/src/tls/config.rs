//! TLS configuration shared by connecting and listening endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{RootCertStore, SupportedCipherSuite};
use tether_core::CipherCapability;
use zeroize::Zeroizing;

use super::identity::{parse_certificates, TlsIdentity};
use crate::error::{TransportError, TransportResult};

/// Builder for [`TlsConfig`].
#[derive(Default)]
pub struct TlsConfigBuilder {
    identities: Vec<(Vec<u8>, Zeroizing<Vec<u8>>)>,
    identity_files: Vec<(PathBuf, PathBuf)>,
    trust_roots_pem: Option<Vec<u8>>,
    cipher_suites: Option<Vec<String>>,
    server_name: Option<String>,
    require_client_auth: bool,
}

impl TlsConfigBuilder {
    /// Creates an empty builder: no identities, no trust roots, every
    /// suite of the ring provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a certificate chain and private key in PEM format.
    ///
    /// May be called more than once; identities keep their order.
    #[must_use]
    pub fn identity_pem(mut self, cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        self.identities
            .push((cert_pem.into(), Zeroizing::new(key_pem.into())));
        self
    }

    /// Adds a certificate chain and private key read from PEM files at
    /// build time.
    #[must_use]
    pub fn identity_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.identity_files.push((cert.into(), key.into()));
        self
    }

    /// Sets the CA certificates used to verify peers.
    ///
    /// Without trust roots, clients accept any server certificate and
    /// treat the server as unauthenticated.
    #[must_use]
    pub fn trust_roots_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.trust_roots_pem = Some(pem.into());
        self
    }

    /// Restricts the enabled cipher suites, in preference order.
    #[must_use]
    pub fn cipher_suites<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.cipher_suites = Some(names.iter().map(|n| n.as_ref().to_string()).collect());
        self
    }

    /// Name clients expect in the server certificate. Defaults to the
    /// host being connected to.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Makes listeners reject clients without a verified certificate.
    #[must_use]
    pub const fn require_client_auth(mut self, required: bool) -> Self {
        self.require_client_auth = required;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate or file is invalid, a suite name
    /// is unknown, no suite remains enabled, or client authentication is
    /// required without trust roots.
    pub fn build(self) -> TransportResult<TlsConfig> {
        let mut identities = Vec::with_capacity(self.identities.len() + self.identity_files.len());
        for (cert_pem, key_pem) in &self.identities {
            identities.push(TlsIdentity::from_pem(cert_pem, key_pem)?);
        }
        for (cert, key) in &self.identity_files {
            identities.push(TlsIdentity::from_files(cert, key)?);
        }

        let trust_roots = match self.trust_roots_pem {
            Some(pem) => {
                let certs = parse_certificates(&pem)?;
                if certs.is_empty() {
                    return Err(TransportError::Certificate("no CA certificates found".into()));
                }
                let mut store = RootCertStore::empty();
                for cert in certs {
                    store.add(cert).map_err(|e| {
                        TransportError::Certificate(format!("failed to add CA certificate: {e}"))
                    })?;
                }
                Some(Arc::new(store))
            },
            None => None,
        };

        if self.require_client_auth && trust_roots.is_none() {
            return Err(TransportError::TlsConfig(
                "client authentication requires trust roots".into(),
            ));
        }

        let base = rustls::crypto::ring::default_provider();
        let cipher_suites = match self.cipher_suites {
            Some(names) => select_suites(&base.cipher_suites, &names)?,
            None => base.cipher_suites.clone(),
        };
        let provider = CryptoProvider {
            cipher_suites,
            ..base
        };

        Ok(TlsConfig {
            identities,
            trust_roots,
            provider: Arc::new(provider),
            server_name: self.server_name,
            require_client_auth: self.require_client_auth,
        })
    }
}

fn select_suites(
    available: &[SupportedCipherSuite],
    names: &[String],
) -> TransportResult<Vec<SupportedCipherSuite>> {
    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let suite = available
            .iter()
            .find(|suite| suite_name(**suite) == *name)
            .ok_or_else(|| TransportError::TlsConfig(format!("unsupported cipher suite {name}")))?;
        selected.push(*suite);
    }
    if selected.is_empty() {
        return Err(TransportError::TlsConfig("no cipher suites enabled".into()));
    }
    Ok(selected)
}

/// Name of a rustls suite, as used in the capability table.
pub(crate) fn suite_name(suite: SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Capability row of a negotiated rustls suite.
pub(crate) fn suite_capability(suite: SupportedCipherSuite) -> TransportResult<CipherCapability> {
    let name = suite_name(suite);
    CipherCapability::lookup(&name)
        .copied()
        .ok_or_else(|| TransportError::handshake(format!("unclassified cipher suite {name}")))
}

/// Certificates, trust roots and suites for TLS endpoints.
pub struct TlsConfig {
    identities: Vec<TlsIdentity>,
    trust_roots: Option<Arc<RootCertStore>>,
    provider: Arc<CryptoProvider>,
    server_name: Option<String>,
    require_client_auth: bool,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("identities", &self.identities)
            .field("trust_roots", &self.trust_roots.as_ref().map(|r| r.len()))
            .field("suites", &self.capabilities().len())
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }

    /// Locally held identities, in configuration order.
    #[must_use]
    pub fn identities(&self) -> &[TlsIdentity] {
        &self.identities
    }

    /// CA certificates used to verify peers.
    #[must_use]
    pub fn trust_roots(&self) -> Option<&Arc<RootCertStore>> {
        self.trust_roots.as_ref()
    }

    #[must_use]
    pub(crate) fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    /// Expected server name override.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Whether listeners require a verified client certificate.
    #[must_use]
    pub const fn requires_client_auth(&self) -> bool {
        self.require_client_auth
    }

    /// Capabilities of the enabled suites, in preference order.
    #[must_use]
    pub fn capabilities(&self) -> Vec<CipherCapability> {
        self.provider
            .cipher_suites
            .iter()
            .filter_map(|suite| suite_capability(*suite).ok())
            .collect()
    }
}
