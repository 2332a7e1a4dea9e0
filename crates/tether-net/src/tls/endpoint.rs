//! TLS client endpoint and listener upgrader.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rustls::client::{ResolvesClientCert, Resumption};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig, SignatureScheme};
use tether_core::{
    client_candidates, negotiate, select_usable, ConstraintSet, HeldCredential, KeyType,
    ListenAuthorizer, NegotiationError, PeerIdentity, Principal, RequestHandle, ServerIdentity,
};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use super::config::{suite_capability, TlsConfig};
use super::identity::{LeafFacts, TlsIdentity};
use super::verifier::AcceptAnyServerCert;
use crate::client::ConnectionEndpoint;
use crate::connection::{connect_budget, BoxedStream, StreamConnection};
use crate::context::SecurityContext;
use crate::error::{TransportError, TransportResult};
use crate::server::ConnectionUpgrader;
use crate::socket_factory::SocketFactory;
use crate::tcp::dial;

/// Name placed in the ephemeral certificate of an anonymous listener.
const ANONYMOUS_SERVER_NAME: &str = "anonymous.tether.invalid";

const KEY_TYPES: [KeyType; 3] = [KeyType::Ec, KeyType::Rsa, KeyType::Ed25519];

fn map_rustls(e: rustls::Error) -> TransportError {
    TransportError::TlsConfig(e.to_string())
}

/// Client certificate for one handshake. Records whether the server asked
/// for it and a usable signature scheme was offered, i.e. whether the
/// certificate was actually sent.
#[derive(Debug)]
struct PresentedCert {
    certified: Arc<CertifiedKey>,
    presented: AtomicBool,
}

impl PresentedCert {
    const fn new(certified: Arc<CertifiedKey>) -> Self {
        Self {
            certified,
            presented: AtomicBool::new(false),
        }
    }

    fn was_presented(&self) -> bool {
        self.presented.load(Ordering::Acquire)
    }
}

impl ResolvesClientCert for PresentedCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        if self.certified.key.choose_scheme(sigschemes).is_some() {
            self.presented.store(true, Ordering::Release);
        }
        Some(Arc::clone(&self.certified))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Identity offered to servers that request a client certificate.
struct OfferedIdentity {
    principal: Principal,
    certified: Arc<CertifiedKey>,
}

/// Connects to one `host:port` over TLS.
///
/// The first usable identity in the configuration is offered as client
/// certificate. A connection records the client as known only if the server
/// requested the certificate. Without trust roots any server certificate is
/// accepted and the server is recorded as unauthenticated.
pub struct TlsEndpoint {
    host: String,
    port: u16,
    factory: Arc<dyn SocketFactory>,
    connect_timeout: Duration,
    config: Arc<TlsConfig>,
    base: Arc<ClientConfig>,
    offered: Option<OfferedIdentity>,
    expected_name: String,
    server_name: ServerName<'static>,
    client: PeerIdentity,
}

impl std::fmt::Debug for TlsEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_name", &self.expected_name)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl TlsEndpoint {
    /// Creates an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the server name is invalid or the client
    /// configuration cannot be built from `config`.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        factory: Arc<dyn SocketFactory>,
        connect_timeout: Duration,
        config: Arc<TlsConfig>,
    ) -> TransportResult<Self> {
        let host = host.into();
        let expected = config.server_name().unwrap_or(&host).to_string();
        let server_name = ServerName::try_from(expected.clone())
            .map_err(|e| TransportError::TlsConfig(format!("invalid server name: {e}")))?;

        let builder = ClientConfig::builder_with_provider(Arc::clone(config.provider()))
            .with_safe_default_protocol_versions()
            .map_err(map_rustls)?;
        let builder = match config.trust_roots() {
            Some(roots) => builder.with_root_certificates(Arc::clone(roots)),
            None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(
                    config.provider().signature_verification_algorithms,
                ))),
        };

        let mut base = builder.with_no_client_auth();
        // A resumed session skips client authentication.
        base.resumption = Resumption::disabled();

        let now = SystemTime::now();
        let offered = config
            .identities()
            .iter()
            .find(|identity| identity.is_valid_at(now) && identity.has_private_key())
            .map(|identity| -> TransportResult<OfferedIdentity> {
                let key = config
                    .provider()
                    .key_provider
                    .load_private_key(identity.private_key()?)
                    .map_err(map_rustls)?;
                Ok(OfferedIdentity {
                    principal: identity.principal().clone(),
                    certified: Arc::new(CertifiedKey::new(identity.chain().to_vec(), key)),
                })
            })
            .transpose()?;
        let client = offered
            .as_ref()
            .map_or(PeerIdentity::Anonymous, |offered| {
                PeerIdentity::Known(offered.principal.clone())
            });

        Ok(Self {
            host,
            port,
            factory,
            connect_timeout,
            config,
            base: Arc::new(base),
            offered,
            expected_name: expected,
            server_name,
            client,
        })
    }

    /// Identity this endpoint offers when a server requests a client
    /// certificate.
    #[must_use]
    pub const fn client_identity(&self) -> &PeerIdentity {
        &self.client
    }

    fn connector(&self) -> (TlsConnector, Option<Arc<PresentedCert>>) {
        let Some(offered) = &self.offered else {
            return (TlsConnector::from(Arc::clone(&self.base)), None);
        };
        let presented = Arc::new(PresentedCert::new(Arc::clone(&offered.certified)));
        let mut config = (*self.base).clone();
        config.client_auth_cert_resolver = Arc::clone(&presented) as Arc<dyn ResolvesClientCert>;
        (TlsConnector::from(Arc::new(config)), Some(presented))
    }

    /// Servers this endpoint could end up talking to: any key type under
    /// the expected name when servers are verified, none otherwise.
    fn possible_servers(&self) -> Vec<ServerIdentity> {
        if self.config.trust_roots().is_none() {
            return Vec::new();
        }
        KEY_TYPES
            .iter()
            .map(|key_type| {
                ServerIdentity::new(Principal::new(self.expected_name.as_str()), *key_type)
            })
            .collect()
    }

    async fn handshake(&self) -> TransportResult<StreamConnection> {
        let (tcp, peer) = dial(&*self.factory, &self.host, self.port).await?;
        let (connector, presented) = self.connector();
        let stream = connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| TransportError::handshake(format!("tls connect to {peer}: {e}")))?;

        let (_, session) = stream.get_ref();
        let suite = session
            .negotiated_cipher_suite()
            .ok_or_else(|| TransportError::handshake("no cipher suite negotiated"))?;
        let suite = suite_capability(suite)?;
        let server = match (self.config.trust_roots(), session.peer_certificates()) {
            (Some(_), Some(certs)) => certs
                .first()
                .map(LeafFacts::parse)
                .transpose()?
                .map(|facts| ServerIdentity::new(facts.principal, facts.key_type)),
            _ => None,
        };
        let client = match (&self.offered, presented) {
            (Some(offered), Some(presented)) if presented.was_presented() => {
                PeerIdentity::Known(offered.principal.clone())
            },
            _ => PeerIdentity::Anonymous,
        };
        debug!(%peer, suite = suite.name, server = ?server, client = ?client, "tls connection established");
        let security = SecurityContext::tls(suite, client, server, Some(peer));
        Ok(StreamConnection::new(Box::new(stream), security))
    }
}

#[async_trait]
impl ConnectionEndpoint for TlsEndpoint {
    async fn connect(&self, handle: &RequestHandle) -> TransportResult<StreamConnection> {
        let budget = connect_budget(handle.constraints(), self.connect_timeout)?;
        timeout(budget, self.handshake())
            .await
            .map_err(|_| TransportError::timeout("tls connect"))?
    }

    fn check_constraints(&self, handle: &RequestHandle) -> Result<(), NegotiationError> {
        negotiate(
            &self.config.capabilities(),
            &self.possible_servers(),
            std::slice::from_ref(&self.client),
            handle.constraints(),
        )
        .map(|_| ())
    }
}

/// Server side TLS handshake for one listen operation.
///
/// Built at listen time: the listen constraints must be satisfiable with
/// the identities the authorizer permits, otherwise listening fails.
pub struct TlsUpgrader {
    acceptor: TlsAcceptor,
    server: Option<ServerIdentity>,
}

impl std::fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsUpgrader")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl TlsUpgrader {
    /// Selects the server identity for a listener.
    ///
    /// Identities the authorizer rejects, expired ones and ones without a
    /// private key are skipped. With none left the listener runs
    /// anonymously behind an ephemeral self-signed certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedConstraints`] if `constraints`
    /// cannot be met, or a configuration error from rustls.
    pub fn for_listen(
        config: &TlsConfig,
        authorizer: &dyn ListenAuthorizer,
        constraints: &ConstraintSet,
    ) -> TransportResult<Self> {
        let usable = select_usable(config.identities(), authorizer, SystemTime::now());
        let negotiated = negotiate(
            &config.capabilities(),
            &usable.server_identities(),
            &client_candidates(constraints),
            constraints,
        )?;

        let chosen: Option<&TlsIdentity> = negotiated.context.server().and_then(|server| {
            usable
                .credentials()
                .iter()
                .find(|identity| identity.server_identity() == *server)
                .copied()
        });
        let (chain, key, server) = match chosen {
            Some(identity) => (
                identity.chain().to_vec(),
                identity.private_key()?,
                Some(identity.server_identity()),
            ),
            None => {
                let (chain, key) = ephemeral_certificate()?;
                (chain, key, None)
            },
        };

        let client_verifier = match config.trust_roots() {
            Some(roots) => {
                let builder = WebPkiClientVerifier::builder_with_provider(
                    Arc::clone(roots),
                    Arc::clone(config.provider()),
                );
                let builder = if config.requires_client_auth() {
                    builder
                } else {
                    builder.allow_unauthenticated()
                };
                builder.build().map_err(|e| {
                    TransportError::TlsConfig(format!("client verifier error: {e}"))
                })?
            },
            None => WebPkiClientVerifier::no_client_auth(),
        };

        let server_config = ServerConfig::builder_with_provider(Arc::clone(config.provider()))
            .with_safe_default_protocol_versions()
            .map_err(map_rustls)?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain, key)
            .map_err(|e| TransportError::TlsConfig(format!("server config error: {e}")))?;

        match &server {
            Some(identity) => info!(principal = %identity.principal, "tls listener identity selected"),
            None => info!("tls listener running anonymously"),
        }
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            server,
        })
    }

    /// Identity presented to clients; `None` when anonymous.
    #[must_use]
    pub const fn server_identity(&self) -> Option<&ServerIdentity> {
        self.server.as_ref()
    }
}

fn ephemeral_certificate() -> TransportResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec![ANONYMOUS_SERVER_NAME.to_string()])
        .map_err(|e| TransportError::Certificate(format!("ephemeral certificate: {e}")))?;
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok((vec![certified.cert.der().clone()], PrivateKeyDer::Pkcs8(key)))
}

#[async_trait]
impl ConnectionUpgrader for TlsUpgrader {
    async fn upgrade(
        &self,
        stream: BoxedStream,
        peer: Option<SocketAddr>,
    ) -> TransportResult<(BoxedStream, SecurityContext)> {
        let stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::handshake(format!("tls accept: {e}")))?;

        let (_, session) = stream.get_ref();
        let suite = session
            .negotiated_cipher_suite()
            .ok_or_else(|| TransportError::handshake("no cipher suite negotiated"))?;
        let suite = suite_capability(suite)?;
        let client = match session.peer_certificates().and_then(<[_]>::first) {
            Some(leaf) => LeafFacts::parse(leaf)
                .map_or(PeerIdentity::Unknown, |facts| PeerIdentity::Known(facts.principal)),
            None => PeerIdentity::Anonymous,
        };
        debug!(peer = ?peer, suite = suite.name, client = ?client, "tls connection accepted");
        let security = SecurityContext::tls(suite, client, self.server.clone(), peer);
        Ok((Box::new(stream), security))
    }
}
