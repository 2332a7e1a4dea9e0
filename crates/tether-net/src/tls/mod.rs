//! TLS transport: identities, configuration, client endpoint and listener
//! upgrader.
//!
//! Suites are classified through the capability table, so every suite the
//! configured provider may negotiate maps to known security properties.

mod config;
mod endpoint;
mod identity;
mod verifier;

pub use config::{TlsConfig, TlsConfigBuilder};
pub use endpoint::{TlsEndpoint, TlsUpgrader};
pub use identity::TlsIdentity;

/// Test utilities for the TLS module.
#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Once;

    use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, SanType};

    static CRYPTO_INIT: Once = Once::new();

    /// Initializes the rustls crypto provider for tests.
    pub fn init_crypto() {
        CRYPTO_INIT.call_once(|| {
            // Another test binary thread may have installed it already.
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    /// In-memory certificate authority.
    pub struct TestCa {
        cert: Certificate,
        key: KeyPair,
    }

    impl TestCa {
        pub fn new() -> Self {
            let mut params = CertificateParams::default();
            params
                .distinguished_name
                .push(DnType::CommonName, "Tether Test CA");
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

            let key = KeyPair::generate().expect("key generation should succeed");
            let cert = params
                .self_signed(&key)
                .expect("self-signing should succeed");
            Self { cert, key }
        }

        pub fn cert_pem(&self) -> String {
            self.cert.pem()
        }
    }

    /// Generates a certificate for `name` (common name and DNS name) signed
    /// by `ca`. Returns the certificate and key PEM.
    pub fn generate_node_cert(ca: &TestCa, name: &str) -> (String, String) {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.subject_alt_names = vec![SanType::DnsName(
            name.try_into().expect("valid DNS name"),
        )];

        let key = KeyPair::generate().expect("node key generation should succeed");
        let cert = params
            .signed_by(&key, &ca.cert, &ca.key)
            .expect("node cert signing should succeed");
        (cert.pem(), key.serialize_pem())
    }
}
