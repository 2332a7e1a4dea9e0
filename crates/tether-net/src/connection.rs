//! Established byte-stream connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use socket2::{SockRef, TcpKeepalive};
use tether_core::{Constraint, ConstraintSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::context::SecurityContext;
use crate::error::{TransportError, TransportResult};

/// Idle time before the first keep-alive probe.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A bidirectional byte stream usable by the mux layer.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream: plain TCP, TLS, or an in-memory pipe in tests.
pub type BoxedStream = Box<dyn AsyncStream>;

/// An established connection: the stream plus the facts learned while
/// setting it up.
///
/// The stream is handed to the mux layer exactly once with
/// [`take_stream`](Self::take_stream).
pub struct StreamConnection {
    id: u64,
    stream: Mutex<Option<BoxedStream>>,
    security: SecurityContext,
    closed: AtomicBool,
}

impl StreamConnection {
    /// Wraps a stream with its security context.
    #[must_use]
    pub fn new(stream: BoxedStream, security: SecurityContext) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream: Mutex::new(Some(stream)),
            security,
            closed: AtomicBool::new(false),
        }
    }

    /// Process-unique connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Security context captured after the handshake.
    #[must_use]
    pub const fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Remote address, if known.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.security.peer_addr()
    }

    /// Takes the stream out of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the connection is
    /// closed or the stream was already taken.
    pub fn take_stream(&self) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.stream
            .lock()
            .expect("lock poisoned")
            .take()
            .ok_or(TransportError::ConnectionClosed)
    }

    /// Marks the connection closed and drops the stream if it was never
    /// taken. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let stream = self.stream.lock().expect("lock poisoned").take();
        drop(stream);
        debug!(connection = self.id, peer = ?self.peer_addr(), "connection closed");
        true
    }

    /// Returns `true` once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("suite", &self.security.suite().name)
            .field("peer_addr", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Disables Nagle and enables keep-alive. Failures are logged only.
pub fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to disable Nagle's algorithm");
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to enable TCP keep-alive");
    }
}

/// Time available for establishing a connection under `constraints`.
///
/// Starts from `default` and is shortened by any `ConnectionTimeout` or
/// `ConnectionDeadline` constraint.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] if a deadline has already passed.
pub fn connect_budget(constraints: &ConstraintSet, default: Duration) -> TransportResult<Duration> {
    let mut budget = default;
    for requirement in constraints {
        match &requirement.constraint {
            Constraint::ConnectionTimeout(limit) => budget = budget.min(*limit),
            Constraint::ConnectionDeadline(deadline) => {
                let remaining = deadline
                    .duration_since(SystemTime::now())
                    .map_err(|_| TransportError::timeout("connection deadline already passed"))?;
                budget = budget.min(remaining);
            },
            _ => {},
        }
    }
    Ok(budget)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> BoxedStream {
        let (a, _b) = tokio::io::duplex(64);
        Box::new(a)
    }

    #[test]
    fn test_stream_taken_once() {
        let conn = StreamConnection::new(pipe(), SecurityContext::plaintext(None));
        assert!(conn.take_stream().is_ok());
        assert!(matches!(
            conn.take_stream(),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_close_exactly_once() {
        let conn = StreamConnection::new(pipe(), SecurityContext::plaintext(None));
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(conn.take_stream().is_err());
    }

    #[test]
    fn test_ids_unique() {
        let a = StreamConnection::new(pipe(), SecurityContext::plaintext(None));
        let b = StreamConnection::new(pipe(), SecurityContext::plaintext(None));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_connect_budget() {
        let default = Duration::from_secs(15);
        assert_eq!(connect_budget(&ConstraintSet::empty(), default).unwrap(), default);

        let short = ConstraintSet::required([Constraint::ConnectionTimeout(Duration::from_secs(2))]);
        assert_eq!(connect_budget(&short, default).unwrap(), Duration::from_secs(2));

        let past = ConstraintSet::preferred([Constraint::ConnectionDeadline(SystemTime::UNIX_EPOCH)]);
        assert!(matches!(
            connect_budget(&past, default),
            Err(TransportError::Timeout { .. })
        ));
    }
}
