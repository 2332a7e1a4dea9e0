//! Constraint-to-capability negotiation.
//!
//! Negotiation decides, for a candidate security configuration, whether a
//! [`ConstraintSet`] is satisfiable and which of its constraints the
//! configuration leaves to the RPC layer (the *residual*). Every function in
//! this module is pure: the same inputs always yield the same output.
//!
//! A candidate is the tuple `(suite, client, server, integrity)`. The
//! `integrity` flag records whether the RPC layer asserts message integrity
//! on top of the suite; it can only be set when the suite itself provides
//! integrity. Each suite is therefore evaluated twice, once with and once
//! without integrity, and the pass that leaves fewer unmet preferences wins.
//! Ties go to the integrity pass.

use thiserror::Error;

use super::capability::{CipherCapability, KeyType};
use super::{Constraint, ConstraintSet, Principal, Toggle};

/// Errors produced by negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// The suite uses a null or anonymous key exchange.
    #[error("cipher suite {suite} uses a null or anonymous key exchange")]
    RejectedSuite {
        /// Suite name.
        suite: String,
    },

    /// The suite is not in the capability table.
    #[error("unknown cipher suite: {suite}")]
    UnknownSuite {
        /// Suite name.
        suite: String,
    },

    /// No cipher suites are enabled locally.
    #[error("no cipher suites enabled")]
    NoSuites,

    /// No candidate satisfies every required constraint.
    #[error("constraints not supported: {reason}")]
    Unsatisfiable {
        /// Human-readable reason.
        reason: String,
    },
}

impl NegotiationError {
    /// Creates an [`NegotiationError::Unsatisfiable`] error.
    #[must_use]
    pub fn unsatisfiable(reason: impl Into<String>) -> Self {
        Self::Unsatisfiable {
            reason: reason.into(),
        }
    }
}

/// Client side of a candidate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerIdentity {
    /// The client presented no credentials.
    Anonymous,
    /// The client authenticated, but its principal is not known here.
    Unknown,
    /// The client authenticated as this principal.
    Known(Principal),
}

impl PeerIdentity {
    /// Returns `true` unless the client is anonymous.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }

    /// Returns the known principal, if any.
    #[must_use]
    pub const fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Known(principal) => Some(principal),
            _ => None,
        }
    }
}

/// Server side of a candidate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    /// Authenticated server principal.
    pub principal: Principal,
    /// Key type of the server certificate.
    pub key_type: KeyType,
}

impl ServerIdentity {
    /// Creates a server identity.
    #[must_use]
    pub const fn new(principal: Principal, key_type: KeyType) -> Self {
        Self {
            principal,
            key_type,
        }
    }
}

/// One evaluated candidate configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    suite: CipherCapability,
    client: PeerIdentity,
    server: Option<ServerIdentity>,
    integrity: bool,
    unmet_preferences: Vec<Constraint>,
}

impl ConnectionContext {
    /// Evaluates `requirements` against one candidate.
    ///
    /// Returns `None` if any required constraint is unmet, if `integrity` is
    /// requested from a suite without integrity, or if the server key type
    /// does not fit the suite.
    #[must_use]
    pub fn evaluate(
        suite: &CipherCapability,
        client: &PeerIdentity,
        server: Option<&ServerIdentity>,
        integrity: bool,
        requirements: &ConstraintSet,
    ) -> Option<Self> {
        if integrity && !suite.integrity {
            return None;
        }
        let server = if suite.authenticates_server() {
            server
        } else {
            None
        };
        if let Some(identity) = server {
            if !suite.accepts_key_type(identity.key_type) {
                return None;
            }
        }

        let mut context = Self {
            suite: *suite,
            client: client.clone(),
            server: server.cloned(),
            integrity,
            unmet_preferences: Vec::new(),
        };

        if requirements.requirements().any(|c| !context.satisfies(c)) {
            return None;
        }
        context.unmet_preferences = requirements
            .preferences()
            .filter(|c| !context.satisfies(c))
            .cloned()
            .collect();
        Some(context)
    }

    /// Returns `true` if this candidate satisfies `constraint`.
    #[must_use]
    pub fn satisfies(&self, constraint: &Constraint) -> bool {
        match constraint {
            Constraint::Integrity(toggle) => toggle.matches(self.integrity),
            Constraint::Confidentiality(toggle) => toggle.matches(self.suite.confidentiality),
            Constraint::ClientAuthentication(toggle) => {
                toggle.matches(self.client.is_authenticated())
            },
            Constraint::ServerAuthentication(toggle) => toggle.matches(self.server.is_some()),
            Constraint::Delegation(Toggle::Yes) | Constraint::DelegationWindow { .. } => {
                self.client == PeerIdentity::Anonymous
            },
            Constraint::Delegation(Toggle::No)
            | Constraint::ConnectionTimeout(_)
            | Constraint::ConnectionDeadline(_) => true,
            Constraint::ClientMinPrincipals(set) => self
                .client
                .principal()
                .is_some_and(|client| set.iter().all(|p| p == client)),
            Constraint::ClientMaxPrincipals(set) => match &self.client {
                PeerIdentity::Anonymous => true,
                PeerIdentity::Unknown => false,
                PeerIdentity::Known(client) => set.contains(client),
            },
            Constraint::ServerMinPrincipals(set) => self
                .server
                .as_ref()
                .is_some_and(|server| set.iter().all(|p| *p == server.principal)),
            Constraint::AnyOf(alternatives) => alternatives.iter().any(|c| self.satisfies(c)),
        }
    }

    /// Constraints this candidate leaves for the RPC layer to enforce.
    #[must_use]
    pub fn residual(&self, requirements: &ConstraintSet) -> ConstraintSet {
        let integrity = Constraint::Integrity(Toggle::Yes);
        let mut builder = ConstraintSet::builder();
        if self.integrity {
            if requirements.requires(&integrity) {
                builder = builder.require(integrity);
            } else if requirements.prefers(&integrity) {
                builder = builder.prefer(integrity);
            }
        }
        for unmet in &self.unmet_preferences {
            builder = builder.prefer(unmet.clone());
        }
        builder.build()
    }

    /// Suite of this candidate.
    #[must_use]
    pub const fn suite(&self) -> &CipherCapability {
        &self.suite
    }

    /// Client identity of this candidate.
    #[must_use]
    pub const fn client(&self) -> &PeerIdentity {
        &self.client
    }

    /// Server identity of this candidate, if authenticated.
    #[must_use]
    pub const fn server(&self) -> Option<&ServerIdentity> {
        self.server.as_ref()
    }

    /// Whether the RPC layer asserts integrity.
    #[must_use]
    pub const fn integrity(&self) -> bool {
        self.integrity
    }

    /// Preferences this candidate does not meet.
    #[must_use]
    pub fn unmet_preferences(&self) -> &[Constraint] {
        &self.unmet_preferences
    }
}

/// The winning candidate of a negotiation, with its residual constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfiguration {
    /// The winning candidate.
    pub context: ConnectionContext,
    /// Constraints left for the RPC layer.
    pub residual: ConstraintSet,
}

fn best_context(
    suite: &CipherCapability,
    client: &PeerIdentity,
    server: Option<&ServerIdentity>,
    requirements: &ConstraintSet,
) -> Option<ConnectionContext> {
    let with_integrity = ConnectionContext::evaluate(suite, client, server, true, requirements);
    let without_integrity = ConnectionContext::evaluate(suite, client, server, false, requirements);
    match (with_integrity, without_integrity) {
        (Some(with), Some(without)) => {
            if without.unmet_preferences.len() < with.unmet_preferences.len() {
                Some(without)
            } else {
                Some(with)
            }
        },
        (with, without) => with.or(without),
    }
}

/// Computes the residual constraints for a concrete configuration.
///
/// # Errors
///
/// Returns [`NegotiationError::RejectedSuite`] for null or anonymous suites
/// and [`NegotiationError::Unsatisfiable`] when no pass is feasible.
pub fn unfulfilled(
    suite: &CipherCapability,
    client: &PeerIdentity,
    server: Option<&ServerIdentity>,
    requirements: &ConstraintSet,
) -> Result<ConstraintSet, NegotiationError> {
    if suite.is_rejected() {
        return Err(NegotiationError::RejectedSuite {
            suite: suite.name.to_string(),
        });
    }
    best_context(suite, client, server, requirements)
        .map(|context| context.residual(requirements))
        .ok_or_else(|| {
            NegotiationError::unsatisfiable(format!(
                "suite {} with client {client:?} cannot meet the required constraints",
                suite.name
            ))
        })
}

/// Like [`unfulfilled`], looking the suite up by name.
///
/// # Errors
///
/// Returns [`NegotiationError::UnknownSuite`] for names missing from the
/// capability table, otherwise as [`unfulfilled`].
pub fn unfulfilled_for_suite(
    suite: &str,
    client: &PeerIdentity,
    server: Option<&ServerIdentity>,
    requirements: &ConstraintSet,
) -> Result<ConstraintSet, NegotiationError> {
    let capability =
        CipherCapability::lookup(suite).ok_or_else(|| NegotiationError::UnknownSuite {
            suite: suite.to_string(),
        })?;
    unfulfilled(capability, client, server, requirements)
}

/// Client identities worth trying for `requirements`.
///
/// Always anonymous and unknown-authenticated, followed by every principal
/// the requirements name.
#[must_use]
pub fn client_candidates(requirements: &ConstraintSet) -> Vec<PeerIdentity> {
    let mut candidates = vec![PeerIdentity::Anonymous, PeerIdentity::Unknown];
    candidates.extend(
        requirements
            .client_principals()
            .into_iter()
            .cloned()
            .map(PeerIdentity::Known),
    );
    candidates
}

/// Searches all candidates for the first feasible configuration.
///
/// Candidates are visited suite by suite, then server identity (restricted
/// to the suite's key type; an empty `servers` slice means the server is
/// anonymous), then client identity.
///
/// # Errors
///
/// Returns [`NegotiationError::NoSuites`] for an empty `suites` slice and
/// [`NegotiationError::Unsatisfiable`] when no candidate is feasible.
pub fn negotiate(
    suites: &[CipherCapability],
    servers: &[ServerIdentity],
    clients: &[PeerIdentity],
    requirements: &ConstraintSet,
) -> Result<NegotiatedConfiguration, NegotiationError> {
    if suites.is_empty() {
        return Err(NegotiationError::NoSuites);
    }

    for suite in suites.iter().filter(|s| !s.is_rejected()) {
        let server_candidates: Vec<Option<&ServerIdentity>> =
            if servers.is_empty() || !suite.authenticates_server() {
                vec![None]
            } else {
                servers
                    .iter()
                    .filter(|s| suite.accepts_key_type(s.key_type))
                    .map(Some)
                    .collect()
            };

        for server in server_candidates {
            for client in clients {
                if let Some(context) = best_context(suite, client, server, requirements) {
                    let residual = context.residual(requirements);
                    return Ok(NegotiatedConfiguration { context, residual });
                }
            }
        }
    }

    Err(NegotiationError::unsatisfiable(
        "no suite and credential combination meets the required constraints",
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn suite(name: &str) -> &'static CipherCapability {
        CipherCapability::lookup(name).unwrap()
    }

    fn rsa_server(name: &str) -> ServerIdentity {
        ServerIdentity::new(Principal::new(name), KeyType::Rsa)
    }

    const RSA_GCM: &str = "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256";
    const RSA_NULL: &str = "TLS_RSA_WITH_NULL_SHA256";

    #[test]
    fn test_rejects_anonymous_suite() {
        let err = unfulfilled(
            suite("TLS_DH_anon_WITH_AES_128_CBC_SHA"),
            &PeerIdentity::Anonymous,
            None,
            &ConstraintSet::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, NegotiationError::RejectedSuite { .. }));
    }

    #[test]
    fn test_unknown_suite() {
        let err = unfulfilled_for_suite(
            "TLS_NOPE",
            &PeerIdentity::Anonymous,
            None,
            &ConstraintSet::empty(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            NegotiationError::UnknownSuite {
                suite: "TLS_NOPE".to_string()
            }
        );
    }

    #[test]
    fn test_empty_requirements_have_empty_residual() {
        let residual = unfulfilled(
            suite(RSA_GCM),
            &PeerIdentity::Anonymous,
            Some(&rsa_server("srv")),
            &ConstraintSet::empty(),
        )
        .unwrap();
        assert!(residual.is_empty());
    }

    #[test]
    fn test_integrity_required_and_served() {
        let reqs = ConstraintSet::required([Constraint::Integrity(Toggle::Yes)]);
        let residual =
            unfulfilled(suite(RSA_GCM), &PeerIdentity::Anonymous, None, &reqs).unwrap();
        assert!(residual.requires(&Constraint::Integrity(Toggle::Yes)));
    }

    #[test]
    fn test_integrity_preferred_and_served() {
        let reqs = ConstraintSet::preferred([Constraint::Integrity(Toggle::Yes)]);
        let residual =
            unfulfilled(suite(RSA_GCM), &PeerIdentity::Anonymous, None, &reqs).unwrap();
        assert!(residual.prefers(&Constraint::Integrity(Toggle::Yes)));
        assert_eq!(residual.len(), 1);
    }

    #[test]
    fn test_integrity_required_on_plaintext_is_unsatisfiable() {
        let reqs = ConstraintSet::required([Constraint::Integrity(Toggle::Yes)]);
        let err = unfulfilled(
            &CipherCapability::PLAINTEXT,
            &PeerIdentity::Anonymous,
            None,
            &reqs,
        )
        .unwrap_err();
        assert!(matches!(err, NegotiationError::Unsatisfiable { .. }));
    }

    #[test]
    fn test_integrity_preferred_on_plaintext_is_residual_preference() {
        let reqs = ConstraintSet::preferred([Constraint::Integrity(Toggle::Yes)]);
        let residual = unfulfilled(
            &CipherCapability::PLAINTEXT,
            &PeerIdentity::Anonymous,
            None,
            &reqs,
        )
        .unwrap();
        assert!(residual.prefers(&Constraint::Integrity(Toggle::Yes)));
    }

    #[test]
    fn test_integrity_no_prefers_without_pass() {
        let reqs = ConstraintSet::preferred([Constraint::Integrity(Toggle::No)]);
        let residual =
            unfulfilled(suite(RSA_GCM), &PeerIdentity::Anonymous, None, &reqs).unwrap();
        assert!(residual.is_empty());
    }

    #[test]
    fn test_confidentiality_on_null_cipher() {
        let required = ConstraintSet::required([Constraint::Confidentiality(Toggle::Yes)]);
        assert!(unfulfilled(
            suite(RSA_NULL),
            &PeerIdentity::Anonymous,
            Some(&rsa_server("srv")),
            &required
        )
        .is_err());

        let preferred = ConstraintSet::preferred([Constraint::Confidentiality(Toggle::Yes)]);
        let residual = unfulfilled(
            suite(RSA_NULL),
            &PeerIdentity::Anonymous,
            Some(&rsa_server("srv")),
            &preferred,
        )
        .unwrap();
        assert!(residual.prefers(&Constraint::Confidentiality(Toggle::Yes)));
    }

    #[test]
    fn test_server_authentication() {
        let reqs = ConstraintSet::required([Constraint::ServerAuthentication(Toggle::Yes)]);
        assert!(unfulfilled(suite(RSA_GCM), &PeerIdentity::Anonymous, None, &reqs).is_err());
        assert!(unfulfilled(
            suite(RSA_GCM),
            &PeerIdentity::Anonymous,
            Some(&rsa_server("srv")),
            &reqs
        )
        .is_ok());
    }

    #[test]
    fn test_server_key_type_mismatch() {
        let ec_server = ServerIdentity::new(Principal::new("srv"), KeyType::Ec);
        let err = unfulfilled(
            suite(RSA_GCM),
            &PeerIdentity::Anonymous,
            Some(&ec_server),
            &ConstraintSet::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, NegotiationError::Unsatisfiable { .. }));
    }

    #[test]
    fn test_client_principal_constraints() {
        let alice = PeerIdentity::Known(Principal::new("alice"));
        let bob = PeerIdentity::Known(Principal::new("bob"));
        let tls13 = suite("TLS13_AES_128_GCM_SHA256");

        let min = ConstraintSet::required([Constraint::client_min(["alice"])]);
        assert!(unfulfilled(tls13, &alice, None, &min).is_ok());
        assert!(unfulfilled(tls13, &bob, None, &min).is_err());
        assert!(unfulfilled(tls13, &PeerIdentity::Anonymous, None, &min).is_err());

        let max = ConstraintSet::required([Constraint::client_max(["alice"])]);
        assert!(unfulfilled(tls13, &alice, None, &max).is_ok());
        assert!(unfulfilled(tls13, &PeerIdentity::Anonymous, None, &max).is_ok());
        assert!(unfulfilled(tls13, &PeerIdentity::Unknown, None, &max).is_err());
        assert!(unfulfilled(tls13, &bob, None, &max).is_err());
    }

    #[test]
    fn test_delegation_only_for_anonymous_clients() {
        let tls13 = suite("TLS13_AES_128_GCM_SHA256");
        let reqs = ConstraintSet::required([Constraint::Delegation(Toggle::Yes)]);
        assert!(unfulfilled(tls13, &PeerIdentity::Anonymous, None, &reqs).is_ok());
        assert!(unfulfilled(tls13, &PeerIdentity::Unknown, None, &reqs).is_err());

        let no = ConstraintSet::required([Constraint::Delegation(Toggle::No)]);
        assert!(unfulfilled(tls13, &PeerIdentity::Unknown, None, &no).is_ok());
    }

    #[test]
    fn test_connection_time_bounds_always_supported() {
        let reqs = ConstraintSet::required([Constraint::ConnectionTimeout(Duration::from_secs(
            5,
        ))]);
        let residual = unfulfilled(
            &CipherCapability::PLAINTEXT,
            &PeerIdentity::Anonymous,
            None,
            &reqs,
        )
        .unwrap();
        assert!(residual.is_empty());
    }

    #[test]
    fn test_any_of() {
        let reqs = ConstraintSet::required([Constraint::AnyOf(vec![
            Constraint::Confidentiality(Toggle::Yes),
            Constraint::ServerAuthentication(Toggle::Yes),
        ])]);
        assert!(unfulfilled(
            &CipherCapability::PLAINTEXT,
            &PeerIdentity::Anonymous,
            None,
            &reqs
        )
        .is_err());
        assert!(unfulfilled(suite(RSA_GCM), &PeerIdentity::Anonymous, None, &reqs).is_ok());
    }

    #[test]
    fn test_negotiate_first_feasible_wins() {
        let suites = [*suite(RSA_NULL), *suite(RSA_GCM)];
        let servers = [rsa_server("srv")];
        let reqs = ConstraintSet::builder()
            .require(Constraint::ServerAuthentication(Toggle::Yes))
            .prefer(Constraint::Confidentiality(Toggle::Yes))
            .build();

        let negotiated =
            negotiate(&suites, &servers, &client_candidates(&reqs), &reqs).unwrap();
        assert_eq!(negotiated.context.suite().name, RSA_NULL);
        assert!(negotiated
            .residual
            .prefers(&Constraint::Confidentiality(Toggle::Yes)));
    }

    #[test]
    fn test_negotiate_filters_server_key_type() {
        let suites = [*suite("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256")];
        let servers = [rsa_server("srv")];
        let reqs = ConstraintSet::empty();
        let err = negotiate(&suites, &servers, &client_candidates(&reqs), &reqs).unwrap_err();
        assert!(matches!(err, NegotiationError::Unsatisfiable { .. }));
    }

    #[test]
    fn test_negotiate_no_suites() {
        let err = negotiate(&[], &[], &[PeerIdentity::Anonymous], &ConstraintSet::empty())
            .unwrap_err();
        assert_eq!(err, NegotiationError::NoSuites);
    }

    #[test]
    fn test_negotiate_uses_named_client_principal() {
        let suites = [*suite("TLS13_AES_256_GCM_SHA384")];
        let reqs = ConstraintSet::required([Constraint::client_min(["carol"])]);
        let negotiated = negotiate(&suites, &[], &client_candidates(&reqs), &reqs).unwrap();
        assert_eq!(
            negotiated.context.client(),
            &PeerIdentity::Known(Principal::new("carol"))
        );
    }

    #[test]
    fn test_client_candidates_order() {
        let reqs = ConstraintSet::required([Constraint::client_max(["zed", "amy"])]);
        let candidates = client_candidates(&reqs);
        assert_eq!(
            candidates,
            vec![
                PeerIdentity::Anonymous,
                PeerIdentity::Unknown,
                PeerIdentity::Known(Principal::new("amy")),
                PeerIdentity::Known(Principal::new("zed")),
            ]
        );
    }
}
