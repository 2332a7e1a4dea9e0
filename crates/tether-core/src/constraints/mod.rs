//! Abstract security constraints and the requirement sets built from them.
//!
//! A caller describes what it needs from a connection as a [`ConstraintSet`]:
//! an immutable collection of [`Requirement`]s, each pairing a [`Constraint`]
//! from a fixed vocabulary with a [`Strength`]. Transports never interpret
//! the set directly; they hand it to [`negotiation`] together with the
//! concrete capabilities of a candidate configuration.
//!
//! # Vocabulary
//!
//! | Constraint               | Satisfied when                                  |
//! |--------------------------|-------------------------------------------------|
//! | `Integrity(Yes/No)`      | the candidate does / does not assert integrity   |
//! | `Confidentiality(Yes/No)`| the cipher suite does / does not encrypt        |
//! | `ClientAuthentication`   | the client is / is not authenticated             |
//! | `ServerAuthentication`   | the server is / is not authenticated             |
//! | `ClientMinPrincipals`    | the client is every listed principal             |
//! | `ClientMaxPrincipals`    | the client is anonymous or one of the principals |
//! | `ServerMinPrincipals`    | the server is every listed principal             |
//! | `Delegation(Yes/No)`     | `Yes` only for anonymous clients                 |
//! | `ConnectionTimeout`      | always (enforced on the connect path)            |
//! | `ConnectionDeadline`     | always (enforced on the connect path)            |
//! | `DelegationWindow`       | only for anonymous clients                       |
//! | `AnyOf(..)`              | any alternative is satisfied                     |
//!
//! # Invariants
//!
//! - A constructed [`ConstraintSet`] is never mutated.
//! - A constraint appears at most once per set. Requiring and preferring the
//!   same constraint collapses to the requirement.

pub mod capability;
pub mod negotiation;

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime};

pub use capability::{CipherCapability, KeyExchange, KeyType, CAPABILITY_TABLE};
pub use negotiation::{
    client_candidates, negotiate, unfulfilled, unfulfilled_for_suite, ConnectionContext,
    NegotiatedConfiguration, NegotiationError, PeerIdentity, ServerIdentity,
};

/// A named security principal, such as the common name of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Principal(String);

impl Principal {
    /// Creates a principal from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the principal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Two-valued setting used by the boolean constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Toggle {
    /// The property must hold.
    Yes,
    /// The property must not hold.
    No,
}

impl Toggle {
    /// Returns `true` if `value` agrees with this setting.
    #[must_use]
    pub const fn matches(self, value: bool) -> bool {
        match self {
            Self::Yes => value,
            Self::No => !value,
        }
    }
}

/// An abstract security constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constraint {
    /// Message integrity.
    Integrity(Toggle),
    /// Message confidentiality.
    Confidentiality(Toggle),
    /// Authentication of the client to the server.
    ClientAuthentication(Toggle),
    /// Authentication of the server to the client.
    ServerAuthentication(Toggle),
    /// Delegation of the client's identity to the server.
    Delegation(Toggle),
    /// The client must authenticate as all of these principals.
    ClientMinPrincipals(BTreeSet<Principal>),
    /// The client may authenticate as at most these principals.
    ClientMaxPrincipals(BTreeSet<Principal>),
    /// The server must authenticate as all of these principals.
    ServerMinPrincipals(BTreeSet<Principal>),
    /// Upper bound on the time spent establishing a connection.
    ConnectionTimeout(Duration),
    /// Absolute deadline for establishing a connection.
    ConnectionDeadline(SystemTime),
    /// Time bounds on delegated credentials.
    DelegationWindow {
        /// Delegation must not start before this instant.
        not_before: SystemTime,
        /// Delegation must end by this instant.
        not_after: SystemTime,
    },
    /// Satisfied when any of the alternatives is satisfied.
    AnyOf(Vec<Constraint>),
}

impl Constraint {
    /// Builds a [`Constraint::ClientMinPrincipals`] from principal names.
    #[must_use]
    pub fn client_min<I, P>(principals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Principal>,
    {
        Self::ClientMinPrincipals(principals.into_iter().map(Into::into).collect())
    }

    /// Builds a [`Constraint::ClientMaxPrincipals`] from principal names.
    #[must_use]
    pub fn client_max<I, P>(principals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Principal>,
    {
        Self::ClientMaxPrincipals(principals.into_iter().map(Into::into).collect())
    }

    /// Builds a [`Constraint::ServerMinPrincipals`] from principal names.
    #[must_use]
    pub fn server_min<I, P>(principals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Principal>,
    {
        Self::ServerMinPrincipals(principals.into_iter().map(Into::into).collect())
    }

    /// Returns `true` if this constraint names client principals.
    #[must_use]
    pub fn constrains_client_principal(&self) -> bool {
        match self {
            Self::ClientMinPrincipals(_) | Self::ClientMaxPrincipals(_) => true,
            Self::AnyOf(alternatives) => alternatives
                .iter()
                .any(Self::constrains_client_principal),
            _ => false,
        }
    }

    fn collect_client_principals<'a>(&'a self, out: &mut BTreeSet<&'a Principal>) {
        match self {
            Self::ClientMinPrincipals(set) | Self::ClientMaxPrincipals(set) => out.extend(set),
            Self::AnyOf(alternatives) => {
                for alternative in alternatives {
                    alternative.collect_client_principals(out);
                }
            },
            _ => {},
        }
    }
}

/// How strongly a constraint is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strength {
    /// Must be satisfied or the operation fails.
    Required,
    /// Satisfied if possible.
    Preferred,
}

/// A constraint tagged with its strength.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    /// The constraint.
    pub constraint: Constraint,
    /// Required or preferred.
    pub strength: Strength,
}

impl Requirement {
    /// Returns `true` for required constraints.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.strength == Strength::Required
    }
}

/// Immutable, unordered collection of requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintSet {
    requirements: Vec<Requirement>,
}

impl ConstraintSet {
    /// The empty set; satisfied by every configuration.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            requirements: Vec::new(),
        }
    }

    /// Starts building a set.
    #[must_use]
    pub const fn builder() -> ConstraintSetBuilder {
        ConstraintSetBuilder {
            requirements: Vec::new(),
        }
    }

    /// Convenience constructor for a set of required constraints.
    #[must_use]
    pub fn required<I: IntoIterator<Item = Constraint>>(constraints: I) -> Self {
        constraints
            .into_iter()
            .fold(Self::builder(), ConstraintSetBuilder::require)
            .build()
    }

    /// Convenience constructor for a set of preferred constraints.
    #[must_use]
    pub fn preferred<I: IntoIterator<Item = Constraint>>(constraints: I) -> Self {
        constraints
            .into_iter()
            .fold(Self::builder(), ConstraintSetBuilder::prefer)
            .build()
    }

    /// Returns `true` if the set has no requirements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Number of requirements in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    /// Iterates over all requirements.
    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter()
    }

    /// Iterates over the required constraints.
    pub fn requirements(&self) -> impl Iterator<Item = &Constraint> {
        self.requirements
            .iter()
            .filter(|r| r.strength == Strength::Required)
            .map(|r| &r.constraint)
    }

    /// Iterates over the preferred constraints.
    pub fn preferences(&self) -> impl Iterator<Item = &Constraint> {
        self.requirements
            .iter()
            .filter(|r| r.strength == Strength::Preferred)
            .map(|r| &r.constraint)
    }

    /// Returns `true` if `constraint` is required.
    #[must_use]
    pub fn requires(&self, constraint: &Constraint) -> bool {
        self.strength_of(constraint) == Some(Strength::Required)
    }

    /// Returns `true` if `constraint` is preferred.
    #[must_use]
    pub fn prefers(&self, constraint: &Constraint) -> bool {
        self.strength_of(constraint) == Some(Strength::Preferred)
    }

    /// Returns the strength with which `constraint` appears, if at all.
    #[must_use]
    pub fn strength_of(&self, constraint: &Constraint) -> Option<Strength> {
        self.requirements
            .iter()
            .find(|r| &r.constraint == constraint)
            .map(|r| r.strength)
    }

    /// Returns `true` if any requirement names client principals.
    #[must_use]
    pub fn constrains_client_principal(&self) -> bool {
        self.requirements
            .iter()
            .any(|r| r.constraint.constrains_client_principal())
    }

    /// Collects every client principal named by the set, in order.
    #[must_use]
    pub fn client_principals(&self) -> Vec<&Principal> {
        let mut out = BTreeSet::new();
        for requirement in &self.requirements {
            requirement.constraint.collect_client_principals(&mut out);
        }
        out.into_iter().collect()
    }

    /// Returns the union of two sets. Requirements win over preferences.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut builder = Self::builder();
        for requirement in self.requirements.iter().chain(&other.requirements) {
            builder = builder.add(requirement.clone());
        }
        builder.build()
    }
}

impl<'a> IntoIterator for &'a ConstraintSet {
    type Item = &'a Requirement;
    type IntoIter = std::slice::Iter<'a, Requirement>;

    fn into_iter(self) -> Self::IntoIter {
        self.requirements.iter()
    }
}

/// Builder for [`ConstraintSet`].
#[derive(Debug, Default)]
#[must_use]
pub struct ConstraintSetBuilder {
    requirements: Vec<Requirement>,
}

impl ConstraintSetBuilder {
    /// Adds a required constraint.
    pub fn require(self, constraint: Constraint) -> Self {
        self.add(Requirement {
            constraint,
            strength: Strength::Required,
        })
    }

    /// Adds a preferred constraint.
    pub fn prefer(self, constraint: Constraint) -> Self {
        self.add(Requirement {
            constraint,
            strength: Strength::Preferred,
        })
    }

    /// Adds a requirement, collapsing duplicates.
    pub fn add(mut self, requirement: Requirement) -> Self {
        match self
            .requirements
            .iter_mut()
            .find(|r| r.constraint == requirement.constraint)
        {
            Some(existing) => {
                if requirement.strength == Strength::Required {
                    existing.strength = Strength::Required;
                }
            },
            None => self.requirements.push(requirement),
        }
        self
    }

    /// Finishes the set.
    #[must_use]
    pub fn build(self) -> ConstraintSet {
        ConstraintSet {
            requirements: self.requirements,
        }
    }
}
