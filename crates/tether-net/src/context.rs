//! Security context of an established connection.

use std::net::{IpAddr, SocketAddr};

use tether_core::{
    unfulfilled, CipherCapability, ConstraintSet, NegotiationError, PeerIdentity, Principal,
    ServerIdentity,
};

/// Negotiated security properties of one connection.
///
/// Captured once after the handshake and threaded from accept through
/// dispatch to every request on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    suite: CipherCapability,
    client: PeerIdentity,
    server: Option<ServerIdentity>,
    peer_addr: Option<SocketAddr>,
}

impl SecurityContext {
    /// Context of a plain TCP connection.
    #[must_use]
    pub const fn plaintext(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            suite: CipherCapability::PLAINTEXT,
            client: PeerIdentity::Anonymous,
            server: None,
            peer_addr,
        }
    }

    /// Context of a TLS connection.
    #[must_use]
    pub const fn tls(
        suite: CipherCapability,
        client: PeerIdentity,
        server: Option<ServerIdentity>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            suite,
            client,
            server,
            peer_addr,
        }
    }

    /// Negotiated cipher suite.
    #[must_use]
    pub const fn suite(&self) -> &CipherCapability {
        &self.suite
    }

    /// Client identity.
    #[must_use]
    pub const fn client(&self) -> &PeerIdentity {
        &self.client
    }

    /// Server identity, if the server authenticated.
    #[must_use]
    pub const fn server(&self) -> Option<&ServerIdentity> {
        self.server.as_ref()
    }

    /// Remote socket address.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Residual constraints for `requirements` on this connection.
    ///
    /// # Errors
    ///
    /// Returns a [`NegotiationError`] if this connection cannot satisfy the
    /// required constraints.
    pub fn unfulfilled(&self, requirements: &ConstraintSet) -> Result<ConstraintSet, NegotiationError> {
        unfulfilled(
            &self.suite,
            &self.client,
            self.server.as_ref(),
            requirements,
        )
    }

    /// Returns `true` if `requirements` can be met on this connection.
    #[must_use]
    pub fn supports(&self, requirements: &ConstraintSet) -> bool {
        self.unfulfilled(requirements).is_ok()
    }
}

/// Facts about an inbound request exposed to the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEntry {
    /// Address of the calling host.
    ClientHost(IpAddr),
    /// Authenticated principal of the caller.
    ClientPrincipal(Principal),
    /// The caller authenticated, but its principal is not known here.
    AuthenticatedClient,
    /// Cipher suite protecting the request.
    CipherSuite(&'static str),
    /// Whether the request is integrity protected.
    Integrity(bool),
}
