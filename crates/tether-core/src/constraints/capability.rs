//! Static cipher-suite capability table.
//!
//! Each row maps a suite name, as printed by `rustls::CipherSuite`'s `Debug`
//! implementation, to the security properties the suite provides. Rows for
//! suites rustls never negotiates (CBC, NULL and anonymous suites) are kept
//! so that a peer advertising them is classified instead of ignored.

/// Key exchange family of a cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyExchange {
    /// Static RSA key transport.
    Rsa,
    /// Ephemeral ECDH authenticated with an RSA certificate.
    EcdheRsa,
    /// Ephemeral ECDH authenticated with an ECDSA certificate.
    EcdheEcdsa,
    /// Ephemeral finite-field DH authenticated with an RSA certificate.
    DheRsa,
    /// TLS 1.3 ephemeral key exchange; authentication is negotiated separately.
    Ephemeral,
    /// Unauthenticated (anonymous) Diffie-Hellman.
    Anonymous,
    /// No key exchange at all.
    Null,
    /// Plain TCP, no TLS layer.
    Plaintext,
}

/// Public key algorithm of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// RSA.
    Rsa,
    /// ECDSA over a named curve.
    Ec,
    /// Ed25519.
    Ed25519,
}

/// Security properties of one cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherCapability {
    /// Suite name.
    pub name: &'static str,
    /// Key exchange family.
    pub key_exchange: KeyExchange,
    /// Certificate key type the suite requires; `None` accepts any.
    pub key_type: Option<KeyType>,
    /// Whether records are integrity protected.
    pub integrity: bool,
    /// Whether records are encrypted.
    pub confidentiality: bool,
}

impl CipherCapability {
    /// Capability of an unprotected TCP stream.
    pub const PLAINTEXT: Self = Self {
        name: "PLAINTEXT",
        key_exchange: KeyExchange::Plaintext,
        key_type: None,
        integrity: false,
        confidentiality: false,
    };

    /// Null and anonymous key exchanges are never negotiated.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(
            self.key_exchange,
            KeyExchange::Anonymous | KeyExchange::Null
        )
    }

    /// Returns `true` if the suite carries a server certificate.
    #[must_use]
    pub const fn authenticates_server(&self) -> bool {
        !matches!(
            self.key_exchange,
            KeyExchange::Anonymous | KeyExchange::Null | KeyExchange::Plaintext
        )
    }

    /// Returns `true` if a server certificate of `key_type` can be used.
    #[must_use]
    pub fn accepts_key_type(&self, key_type: KeyType) -> bool {
        self.key_type.map_or(true, |required| required == key_type)
    }

    /// Finds a row by suite name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<&'static Self> {
        CAPABILITY_TABLE.iter().find(|row| row.name == name)
    }
}

const fn row(
    name: &'static str,
    key_exchange: KeyExchange,
    key_type: Option<KeyType>,
    integrity: bool,
    confidentiality: bool,
) -> CipherCapability {
    CipherCapability {
        name,
        key_exchange,
        key_type,
        integrity,
        confidentiality,
    }
}

/// Every suite this transport knows how to classify.
pub static CAPABILITY_TABLE: &[CipherCapability] = &[
    // TLS 1.3
    row("TLS13_AES_128_GCM_SHA256", KeyExchange::Ephemeral, None, true, true),
    row("TLS13_AES_256_GCM_SHA384", KeyExchange::Ephemeral, None, true, true),
    row("TLS13_CHACHA20_POLY1305_SHA256", KeyExchange::Ephemeral, None, true, true),
    // TLS 1.2 AEAD
    row("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256", KeyExchange::EcdheEcdsa, Some(KeyType::Ec), true, true),
    row("TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", KeyExchange::EcdheEcdsa, Some(KeyType::Ec), true, true),
    row("TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256", KeyExchange::EcdheEcdsa, Some(KeyType::Ec), true, true),
    row("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", KeyExchange::EcdheRsa, Some(KeyType::Rsa), true, true),
    row("TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", KeyExchange::EcdheRsa, Some(KeyType::Rsa), true, true),
    row("TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256", KeyExchange::EcdheRsa, Some(KeyType::Rsa), true, true),
    // Legacy
    row("TLS_RSA_WITH_AES_128_CBC_SHA", KeyExchange::Rsa, Some(KeyType::Rsa), true, true),
    row("TLS_RSA_WITH_AES_256_CBC_SHA", KeyExchange::Rsa, Some(KeyType::Rsa), true, true),
    row("TLS_DHE_RSA_WITH_AES_128_CBC_SHA", KeyExchange::DheRsa, Some(KeyType::Rsa), true, true),
    row("TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA", KeyExchange::EcdheEcdsa, Some(KeyType::Ec), true, true),
    row("TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA", KeyExchange::EcdheRsa, Some(KeyType::Rsa), true, true),
    // Integrity only
    row("TLS_RSA_WITH_NULL_SHA", KeyExchange::Rsa, Some(KeyType::Rsa), true, false),
    row("TLS_RSA_WITH_NULL_SHA256", KeyExchange::Rsa, Some(KeyType::Rsa), true, false),
    row("TLS_ECDHE_ECDSA_WITH_NULL_SHA", KeyExchange::EcdheEcdsa, Some(KeyType::Ec), true, false),
    row("TLS_ECDHE_RSA_WITH_NULL_SHA", KeyExchange::EcdheRsa, Some(KeyType::Rsa), true, false),
    // Rejected
    row("TLS_DH_anon_WITH_AES_128_CBC_SHA", KeyExchange::Anonymous, None, true, true),
    row("TLS_DH_anon_WITH_AES_256_CBC_SHA", KeyExchange::Anonymous, None, true, true),
    row("TLS_ECDH_anon_WITH_AES_128_CBC_SHA", KeyExchange::Anonymous, None, true, true),
    row("TLS_ECDH_anon_WITH_NULL_SHA", KeyExchange::Anonymous, None, true, false),
    row("TLS_NULL_WITH_NULL_NULL", KeyExchange::Null, None, false, false),
];
