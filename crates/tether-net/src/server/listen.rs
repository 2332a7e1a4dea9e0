//! Listen operations: one accept loop per bound socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tether_core::AcceptConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::throttle::AcceptThrottle;
use super::{ServerConnection, ServerSessionManager};
use crate::connection::{tune_socket, AsyncStream};
use crate::error::{TransportError, TransportResult};

/// Reason sent to clients when a listen operation closes.
const CLOSE_REASON: &str = "listener closed";

/// Source of accepted streams.
#[async_trait]
pub trait SocketListener: Send + Sync + 'static {
    /// Accepted stream type.
    type Stream: AsyncStream;

    /// Waits for the next connection.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Bound address.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Applies socket options to an accepted stream. Must not fail.
    fn tune(&self, _stream: &Self::Stream) {}
}

#[async_trait]
impl SocketListener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        Self::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Self::local_addr(self)
    }

    fn tune(&self, stream: &TcpStream) {
        tune_socket(stream);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Listening,
    Closed,
}

enum AcceptFailure {
    Recoverable,
    Security,
    Fatal,
}

fn classify(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::PermissionDenied => AcceptFailure::Security,
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported | io::ErrorKind::NotConnected => {
            AcceptFailure::Fatal
        },
        _ => AcceptFailure::Recoverable,
    }
}

struct ListenState {
    phase: Phase,
    local_addr: Option<SocketAddr>,
    live: HashMap<u64, Arc<ServerConnection>>,
    task: Option<JoinHandle<()>>,
    failure: Option<String>,
}

struct ListenInner {
    manager: ServerSessionManager,
    accept: AcceptConfig,
    cancel: CancellationToken,
    stopped: CancellationToken,
    state: Mutex<ListenState>,
}

/// Accept loop over one listening socket.
///
/// `Created → Listening → Closed`. Listening is entered once; closing is
/// idempotent and closes the socket and every live connection.
pub struct ListenOperation {
    inner: Arc<ListenInner>,
}

impl std::fmt::Debug for ListenOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ListenOperation")
            .field("phase", &state.phase)
            .field("local_addr", &state.local_addr)
            .field("live", &state.live.len())
            .finish_non_exhaustive()
    }
}

impl ListenOperation {
    /// Creates an operation that dispatches through `manager`.
    #[must_use]
    pub fn new(manager: ServerSessionManager, accept: AcceptConfig) -> Self {
        Self {
            inner: Arc::new(ListenInner {
                manager,
                accept,
                cancel: CancellationToken::new(),
                stopped: CancellationToken::new(),
                state: Mutex::new(ListenState {
                    phase: Phase::Created,
                    local_addr: None,
                    live: HashMap::new(),
                    task: None,
                    failure: None,
                }),
            }),
        }
    }

    /// Starts accepting on `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] unless the operation is fresh, or
    /// the error reading the bound address.
    pub fn listen<L: SocketListener>(&self, listener: L) -> TransportResult<SocketAddr> {
        let local_addr = listener.local_addr()?;
        let mut state = self.inner.lock();
        if state.phase != Phase::Created {
            return Err(TransportError::Closed {
                component: "listen operation",
            });
        }
        state.phase = Phase::Listening;
        state.local_addr = Some(local_addr);

        let span = info_span!("accept", addr = %local_addr);
        state.task = Some(
            self.inner
                .manager
                .settings()
                .runtime
                .spawn(accept_loop(Arc::clone(&self.inner), listener).instrument(span)),
        );
        info!(addr = %local_addr, "listening");
        Ok(local_addr)
    }

    /// Bound address once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().phase == Phase::Closed
    }

    /// Connections accepted and not yet finished.
    #[must_use]
    pub fn live_connections(&self) -> Vec<Arc<ServerConnection>> {
        self.inner.lock().live.values().cloned().collect()
    }

    /// Why the accept loop stopped on its own, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner.lock().failure.clone()
    }

    /// Waits until the accept loop has exited.
    pub async fn accept_stopped(&self) {
        self.inner.stopped.cancelled().await;
    }

    /// Closes the socket and every live connection.
    ///
    /// Waits, bounded by the handshake timeout, for the accept loop to exit;
    /// no connection is dispatched after this returns. Returns `true` only
    /// for the call that closed the operation.
    pub async fn close(&self) -> bool {
        let (task, live, addr) = {
            let mut state = self.inner.lock();
            if state.phase == Phase::Closed {
                return false;
            }
            state.phase = Phase::Closed;
            (state.task.take(), std::mem::take(&mut state.live), state.local_addr)
        };
        self.inner.cancel.cancel();

        if let Some(task) = task {
            let limit = self.inner.manager.settings().handshake_timeout;
            if timeout(limit, task).await.is_err() {
                warn!(addr = ?addr, "accept loop did not stop in time");
            }
        }
        for connection in live.into_values() {
            connection.close_gracefully(CLOSE_REASON);
        }
        info!(addr = ?addr, "listen closed");
        true
    }
}

impl ListenInner {
    fn lock(&self) -> MutexGuard<'_, ListenState> {
        self.state.lock().expect("lock poisoned")
    }

    fn admit(self: &Arc<Self>, stream: Box<dyn AsyncStream>, peer: SocketAddr) {
        let connection = ServerConnection::new(Some(peer));
        {
            let mut state = self.lock();
            if state.phase == Phase::Closed {
                drop(state);
                connection.close_self();
                debug!(peer = %peer, "closing connection accepted after close");
                return;
            }
            state.live.insert(connection.id(), Arc::clone(&connection));
        }
        debug!(peer = %peer, connection = connection.id(), "accepted connection");

        let listen = Arc::downgrade(self);
        self.manager.handle_connection(stream, connection, move |id| {
            if let Some(listen) = listen.upgrade() {
                listen.lock().live.remove(&id);
            }
        });
    }
}

async fn accept_loop<L: SocketListener>(inner: Arc<ListenInner>, listener: L) {
    let mut throttle = AcceptThrottle::from_config(&inner.accept);
    let outcome: TransportResult<()> = loop {
        let accepted = tokio::select! {
            () = inner.cancel.cancelled() => break Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                listener.tune(&stream);
                inner.admit(Box::new(stream), peer);
            },
            Err(_) if inner.cancel.is_cancelled() => break Ok(()),
            Err(e) => match classify(&e) {
                AcceptFailure::Security => {
                    break Err(TransportError::security(format!("accept refused: {e}")));
                },
                AcceptFailure::Fatal => break Err(e.into()),
                AcceptFailure::Recoverable => {
                    warn!(error = %e, "accept failed");
                    if let Some(pause) = throttle.record_failure(Instant::now()) {
                        warn!(pause_ms = pause.as_millis(), "accept failures in burst, pausing");
                        tokio::select! {
                            () = inner.cancel.cancelled() => break Ok(()),
                            () = sleep(pause) => {},
                        }
                    }
                },
            },
        }
    };
    drop(listener);

    match outcome {
        Ok(()) => debug!("accept loop finished"),
        Err(e) => {
            error!(error = %e, "accept loop failed");
            inner.lock().failure = Some(e.to_string());
        },
    }
    inner.stopped.cancel();
}

/// Opaque handle to a listen operation.
///
/// Handles compare equal when they refer to the same operation.
#[derive(Clone)]
pub struct ListenHandle {
    cookie: Uuid,
    operation: Arc<ListenOperation>,
}

impl ListenHandle {
    /// Wraps an operation with a fresh cookie.
    #[must_use]
    pub fn new(operation: ListenOperation) -> Self {
        Self {
            cookie: Uuid::new_v4(),
            operation: Arc::new(operation),
        }
    }

    /// Identity used for deduplication.
    #[must_use]
    pub const fn cookie(&self) -> Uuid {
        self.cookie
    }

    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.operation.local_addr()
    }

    /// The underlying operation.
    #[must_use]
    pub fn operation(&self) -> &ListenOperation {
        &self.operation
    }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.operation.is_closed()
    }

    /// Closes the operation. Returns `true` only for the first close.
    pub async fn close(&self) -> bool {
        self.operation.close().await
    }
}

impl PartialEq for ListenHandle {
    fn eq(&self, other: &Self) -> bool {
        self.cookie == other.cookie
    }
}

impl Eq for ListenHandle {}

impl std::fmt::Debug for ListenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenHandle")
            .field("cookie", &self.cookie)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}
