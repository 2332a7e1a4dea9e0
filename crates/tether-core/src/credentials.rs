//! Selection of the local credentials a listener may use.

use std::time::SystemTime;

use tracing::debug;

use crate::constraints::{KeyType, Principal, ServerIdentity};

/// A locally held credential: a certificate and its private key.
pub trait HeldCredential {
    /// Principal the certificate names.
    fn principal(&self) -> &Principal;

    /// Public key algorithm of the certificate.
    fn key_type(&self) -> KeyType;

    /// Returns `true` if `now` lies inside the certificate validity window.
    fn is_valid_at(&self, now: SystemTime) -> bool;

    /// Returns `true` if a private key matching the certificate is loadable.
    fn has_private_key(&self) -> bool;

    /// Server identity this credential would present.
    fn server_identity(&self) -> ServerIdentity {
        ServerIdentity::new(self.principal().clone(), self.key_type())
    }
}

/// Decides whether a principal may be used to accept connections.
pub trait ListenAuthorizer: Send + Sync {
    /// Returns `true` if `principal` may listen.
    fn may_listen(&self, principal: &Principal) -> bool;
}

/// Authorizer that permits every principal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ListenAuthorizer for AllowAll {
    fn may_listen(&self, _principal: &Principal) -> bool {
        true
    }
}

impl<F> ListenAuthorizer for F
where
    F: Fn(&Principal) -> bool + Send + Sync,
{
    fn may_listen(&self, principal: &Principal) -> bool {
        self(principal)
    }
}

/// Outcome of credential selection.
#[derive(Debug)]
pub enum UsableCredentials<'a, C> {
    /// At least one credential can be presented.
    Authenticated(Vec<&'a C>),
    /// Nothing usable; the endpoint runs anonymously.
    Anonymous,
}

impl<'a, C: HeldCredential> UsableCredentials<'a, C> {
    /// Server identities of the usable credentials; empty when anonymous.
    #[must_use]
    pub fn server_identities(&self) -> Vec<ServerIdentity> {
        match self {
            Self::Authenticated(held) => held.iter().map(|c| c.server_identity()).collect(),
            Self::Anonymous => Vec::new(),
        }
    }

    /// Returns `true` when no credential is usable.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// The usable credentials in input order.
    #[must_use]
    pub fn credentials(&self) -> &[&'a C] {
        match self {
            Self::Authenticated(held) => held,
            Self::Anonymous => &[],
        }
    }
}

/// Filters `held` down to the credentials usable for listening at `now`.
///
/// A credential is usable when the authorizer permits its principal, its
/// certificate is inside the validity window and its private key loads.
/// Failing credentials are skipped without error.
pub fn select_usable<'a, C: HeldCredential>(
    held: &'a [C],
    authorizer: &dyn ListenAuthorizer,
    now: SystemTime,
) -> UsableCredentials<'a, C> {
    let usable: Vec<&C> = held
        .iter()
        .filter(|credential| {
            let principal = credential.principal();
            if !authorizer.may_listen(principal) {
                debug!(%principal, "principal not authorized to listen");
                return false;
            }
            if !credential.is_valid_at(now) {
                debug!(%principal, "certificate outside validity window");
                return false;
            }
            if !credential.has_private_key() {
                debug!(%principal, "no matching private key");
                return false;
            }
            true
        })
        .collect();

    if usable.is_empty() {
        UsableCredentials::Anonymous
    } else {
        UsableCredentials::Authenticated(usable)
    }
}
