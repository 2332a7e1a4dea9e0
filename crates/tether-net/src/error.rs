//! Transport error types.
//!
//! Callers of the transport see one of two categories: a negotiation failure
//! (the requested constraints cannot be met) or an I/O-category failure.
//! Mux protocol internals are folded into the I/O category before they
//! reach the caller.

use std::io;

use tether_core::{ConfigError, NegotiationError};
use thiserror::Error;

use crate::mux::MuxError;

/// Errors that can occur in transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// TLS or mux handshake failure.
    #[error("handshake failed: {reason}")]
    Handshake {
        /// Description of the failure.
        reason: String,
    },

    /// The requested constraints cannot be satisfied.
    #[error("constraints not supported: {0}")]
    UnsupportedConstraints(#[from] NegotiationError),

    /// A security policy refused the operation.
    #[error("security failure: {reason}")]
    Security {
        /// Description of the refusal.
        reason: String,
    },

    /// Invalid transport configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Certificate parsing error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Private key parsing error.
    #[error("private key error: {0}")]
    PrivateKey(String),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer is shutting the connection down gracefully; the request was
    /// not delivered and may be retried on another connection.
    #[error("connection shutting down: {reason}")]
    Shutdown {
        /// Reason given by the peer.
        reason: String,
    },

    /// The component was already shut down locally.
    #[error("{component} is shut down")]
    Closed {
        /// Component name.
        component: &'static str,
    },
}

impl TransportError {
    /// Create a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a handshake error.
    #[must_use]
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    /// Create a security error.
    #[must_use]
    pub fn security(reason: impl Into<String>) -> Self {
        Self::Security {
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying on a fresh connection may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout { .. } | Self::ConnectionClosed | Self::Shutdown { .. }
        )
    }

    /// Returns `true` for security and policy refusals, which are never
    /// retried.
    #[must_use]
    pub const fn is_security(&self) -> bool {
        matches!(
            self,
            Self::Security { .. } | Self::Certificate(_) | Self::PrivateKey(_)
        )
    }

    /// Returns `true` if the peer asked for the request to go elsewhere.
    #[must_use]
    pub const fn is_graceful_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }
}

impl From<MuxError> for TransportError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(e) => Self::Io(e),
            MuxError::Shutdown { reason } => Self::Shutdown { reason },
            MuxError::ConnectionClosed => Self::ConnectionClosed,
            MuxError::HandshakeTimeout => Self::timeout("mux handshake"),
            MuxError::Handshake { reason } | MuxError::VersionMismatch { reason } => {
                Self::Handshake { reason }
            },
            other => Self::Io(io::Error::new(io::ErrorKind::InvalidData, other.to_string())),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
