#![allow(clippy::doc_markdown)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! # tether-core
//!
//! Transport-independent pieces of the tether RPC transport.
//!
//! This crate holds everything that can be decided without touching a
//! socket:
//!
//! - Accept security requirements as a [`ConstraintSet`]
//! - Classify cipher suites through the static [`CAPABILITY_TABLE`]
//! - Decide feasibility and residual constraints via
//!   [`constraints::negotiation`]
//! - Pick usable local credentials with [`credentials::select_usable`]
//! - Carry per-request identity in a [`RequestHandle`]
//! - Load [`TransportConfig`] from defaults, TOML and the environment
//!
//! ## Example
//!
//! ```rust
//! use tether_core::{
//!     client_candidates, negotiate, CipherCapability, Constraint, ConstraintSet, Toggle,
//! };
//!
//! let requirements = ConstraintSet::builder()
//!     .require(Constraint::Confidentiality(Toggle::Yes))
//!     .prefer(Constraint::Integrity(Toggle::Yes))
//!     .build();
//!
//! let suites = [*CipherCapability::lookup("TLS13_AES_128_GCM_SHA256").unwrap()];
//! let negotiated =
//!     negotiate(&suites, &[], &client_candidates(&requirements), &requirements)
//!         .unwrap();
//!
//! assert!(negotiated.residual.prefers(&Constraint::Integrity(Toggle::Yes)));
//! ```
//!
//! Networking lives in the `tether-net` crate.

pub mod config;
pub mod constraints;
pub mod credentials;
pub mod handle;

pub use config::{AcceptConfig, ConfigError, TransportConfig};
pub use constraints::{
    client_candidates, negotiate, unfulfilled, unfulfilled_for_suite, CipherCapability, Constraint,
    ConstraintSet, ConstraintSetBuilder, KeyExchange, KeyType, NegotiatedConfiguration,
    NegotiationError, PeerIdentity, Principal, Requirement, ServerIdentity, Strength, Toggle,
    CAPABILITY_TABLE,
};
pub use credentials::{select_usable, AllowAll, HeldCredential, ListenAuthorizer, UsableCredentials};
pub use handle::RequestHandle;
