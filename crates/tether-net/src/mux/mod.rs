//! Session multiplexing over one byte stream.
//!
//! A [`MuxConnection`] carries many independent [`MuxSession`]s over a single
//! TCP or TLS stream. Each connection runs two driver tasks: a writer that
//! serializes frames from all sessions, and a reader that routes inbound
//! frames to their sessions.
//!
//! # Lifecycle
//!
//! 1. The client sends `HELLO`, the server answers `HELLO_ACK`; both sides
//!    settle on the smaller session limit. The exchange is bounded by the
//!    handshake timeout.
//! 2. The client opens sessions with strictly increasing ids; ids are never
//!    reused on one connection.
//! 3. Either side half-closes a session with `CLOSE` or kills it with
//!    `ABORT`.
//! 4. A server leaving gracefully sends `SHUTDOWN` naming the last session
//!    it dispatched. Every later session was not delivered and may be
//!    retried elsewhere.
//!
//! # Invariants
//!
//! - A failure of one session never affects its siblings.
//! - After [`MuxConnection::graceful_shutdown`] returns, no further session
//!   can be marked dispatched.

mod codec;
mod connection;
mod session;

use std::io;
use std::time::Duration;

pub use codec::{Frame, FrameCodec, HEADER_LEN, MAGIC, MAX_PAYLOAD, VERSION};
pub use connection::MuxConnection;
pub use session::{MuxSession, SessionHandle, SessionReader, SessionStatus, SessionWriter};
use thiserror::Error;
use tokio::runtime::Handle;

/// Mux protocol errors.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame length exceeds [`MAX_PAYLOAD`]. Detected before allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Length from the frame header.
        size: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Frame structure is invalid.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// A well-formed frame arrived where the protocol forbids it.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violation.
        reason: String,
    },

    /// The handshake exchange failed.
    #[error("mux handshake failed: {reason}")]
    Handshake {
        /// Description of the failure.
        reason: String,
    },

    /// The peer speaks another protocol version.
    #[error("mux version mismatch: {reason}")]
    VersionMismatch {
        /// Description of the mismatch.
        reason: String,
    },

    /// The handshake did not finish in time.
    #[error("mux handshake timed out")]
    HandshakeTimeout,

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer is shutting down gracefully.
    #[error("connection shutting down: {reason}")]
    Shutdown {
        /// Reason given by the peer.
        reason: String,
    },

    /// The session id space of this connection is used up.
    #[error("session ids exhausted")]
    SessionIdsExhausted,
}

impl MuxError {
    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize) -> Self {
        Self::FrameTooLarge {
            size,
            max: MAX_PAYLOAD,
        }
    }

    /// Create an invalid frame error.
    #[must_use]
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Create a protocol violation error.
    #[must_use]
    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create a handshake error.
    #[must_use]
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the peer broke the protocol.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::InvalidFrame { .. }
                | Self::ProtocolViolation { .. }
                | Self::VersionMismatch { .. }
        )
    }
}

/// Per-connection mux settings.
#[derive(Debug, Clone)]
pub struct MuxSettings {
    /// Sessions this side allows on one connection.
    pub max_sessions: u32,
    /// Bound on the `HELLO` exchange.
    pub handshake_timeout: Duration,
    /// Runtime the driver tasks are spawned on.
    pub runtime: Handle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classification() {
        assert!(MuxError::frame_too_large(MAX_PAYLOAD + 1).is_protocol_violation());
        assert!(MuxError::invalid_frame("bad op").is_protocol_violation());
        assert!(MuxError::protocol_violation("duplicate open").is_protocol_violation());

        assert!(!MuxError::handshake("no hello").is_protocol_violation());
        assert!(!MuxError::ConnectionClosed.is_protocol_violation());
        assert!(!MuxError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_protocol_violation());
    }
}
