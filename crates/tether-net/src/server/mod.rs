//! Server side: accepted connections and session dispatch.
//!
//! Every accepted stream is upgraded (TLS handshake or nothing), wrapped in
//! a mux connection, and each session the client opens is handed to the
//! [`Dispatcher`] as an [`InboundRequest`] exactly once.

mod listen;
mod throttle;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
pub use listen::{ListenHandle, ListenOperation, SocketListener};
use tether_core::{ConstraintSet, PeerIdentity};
pub use throttle::AcceptThrottle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::connection::BoxedStream;
use crate::context::{ContextEntry, SecurityContext};
use crate::error::TransportResult;
use crate::mux::{MuxConnection, MuxSession, MuxSettings, SessionReader, SessionStatus, SessionWriter};

static NEXT_SERVER_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives inbound requests.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Handles one request. Called at most once per session.
    async fn dispatch(&self, request: InboundRequest);
}

/// Turns an accepted stream into a secured one.
#[async_trait]
pub trait ConnectionUpgrader: Send + Sync + 'static {
    /// Runs the security handshake, if any, and reports what it established.
    async fn upgrade(
        &self,
        stream: BoxedStream,
        peer: Option<SocketAddr>,
    ) -> TransportResult<(BoxedStream, SecurityContext)>;
}

/// Upgrader for plain TCP: no handshake, plaintext context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextUpgrader;

#[async_trait]
impl ConnectionUpgrader for PlaintextUpgrader {
    async fn upgrade(
        &self,
        stream: BoxedStream,
        peer: Option<SocketAddr>,
    ) -> TransportResult<(BoxedStream, SecurityContext)> {
        Ok((stream, SecurityContext::plaintext(peer)))
    }
}

/// A request received on a session.
pub struct InboundRequest {
    session: MuxSession,
    security: Arc<SecurityContext>,
    connection: u64,
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("connection", &self.connection)
            .field("session", &self.session.handle.id())
            .field("suite", &self.security.suite().name)
            .finish_non_exhaustive()
    }
}

impl InboundRequest {
    /// Session id on its connection.
    #[must_use]
    pub const fn session_id(&self) -> u32 {
        self.session.handle.id()
    }

    /// Id of the carrying connection.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection
    }

    /// Stream for the request body.
    pub fn request_reader(&mut self) -> &mut SessionReader {
        &mut self.session.reader
    }

    /// Stream for the response body.
    pub fn response_writer(&mut self) -> &mut SessionWriter {
        &mut self.session.writer
    }

    /// Security context of the carrying connection.
    #[must_use]
    pub fn security_context(&self) -> &SecurityContext {
        &self.security
    }

    /// Appends what the transport knows about the caller.
    pub fn populate_context(&self, entries: &mut Vec<ContextEntry>) {
        if let Some(peer) = self.security.peer_addr() {
            entries.push(ContextEntry::ClientHost(peer.ip()));
        }
        match self.security.client() {
            PeerIdentity::Known(principal) => {
                entries.push(ContextEntry::ClientPrincipal(principal.clone()));
            },
            PeerIdentity::Unknown => entries.push(ContextEntry::AuthenticatedClient),
            PeerIdentity::Anonymous => {},
        }
        let suite = self.security.suite();
        entries.push(ContextEntry::CipherSuite(suite.name));
        entries.push(ContextEntry::Integrity(suite.integrity));
    }

    /// Checks per-request constraints against the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedConstraints`](crate::TransportError::UnsupportedConstraints)
    /// if the connection cannot meet them.
    pub fn check_constraints(&self, constraints: &ConstraintSet) -> TransportResult<ConstraintSet> {
        Ok(self.security.unfulfilled(constraints)?)
    }

    /// Delivery state shared with the connection driver.
    #[must_use]
    pub fn status(&self) -> &Arc<SessionStatus> {
        self.session.handle.status()
    }

    /// Aborts the request. Best effort.
    pub fn abort(&self) {
        self.session.handle.abort(true);
    }
}

/// Server-side state of one accepted connection.
pub struct ServerConnection {
    id: u64,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
    mux: Mutex<Option<MuxConnection>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Creates the state for a newly accepted connection.
    #[must_use]
    pub fn new(peer: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SERVER_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            closed: AtomicBool::new(false),
            mux: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns `true` once closed by either side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Owner-initiated close. Undispatched sessions are refused as not
    /// delivered. Returns `true` only for the call that closed it.
    pub fn close_gracefully(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        let mux = self.mux.lock().expect("lock poisoned").clone();
        if let Some(mux) = mux {
            mux.graceful_shutdown(reason);
        }
        debug!(connection = self.id, peer = ?self.peer, %reason, "connection closed by owner");
        true
    }

    fn attach(&self, mux: &MuxConnection) -> bool {
        let mut slot = self.mux.lock().expect("lock poisoned");
        if self.is_closed() {
            return false;
        }
        *slot = Some(mux.clone());
        true
    }

    fn close_self(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Runs accepted connections and dispatches their sessions.
#[derive(Clone)]
pub struct ServerSessionManager {
    upgrader: Arc<dyn ConnectionUpgrader>,
    dispatcher: Arc<dyn Dispatcher>,
    settings: MuxSettings,
}

impl std::fmt::Debug for ServerSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSessionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ServerSessionManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        upgrader: Arc<dyn ConnectionUpgrader>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: MuxSettings,
    ) -> Self {
        Self {
            upgrader,
            dispatcher,
            settings,
        }
    }

    /// Mux settings used for accepted connections.
    #[must_use]
    pub const fn settings(&self) -> &MuxSettings {
        &self.settings
    }

    /// Drives one accepted connection on the runtime.
    ///
    /// `on_closed` runs once if the connection ends on its own; it does not
    /// run after [`ServerConnection::close_gracefully`].
    pub fn handle_connection<F>(
        &self,
        stream: BoxedStream,
        connection: Arc<ServerConnection>,
        on_closed: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let span = debug_span!("connection", id = connection.id(), peer = ?connection.peer_addr());
        self.settings
            .runtime
            .spawn(drive(self.clone(), stream, connection, on_closed).instrument(span))
    }
}

async fn drive<F>(
    manager: ServerSessionManager,
    stream: BoxedStream,
    connection: Arc<ServerConnection>,
    on_closed: F,
) where
    F: FnOnce(u64) + Send + 'static,
{
    let settings = &manager.settings;
    let upgraded = tokio::select! {
        () = connection.cancel.cancelled() => return,
        upgraded = timeout(
            settings.handshake_timeout,
            manager.upgrader.upgrade(stream, connection.peer_addr()),
        ) => upgraded,
    };
    let (stream, security) = match upgraded {
        Ok(Ok(upgraded)) => upgraded,
        Ok(Err(e)) => {
            warn!(error = %e, "connection handshake failed");
            finish(&connection, on_closed);
            return;
        },
        Err(_) => {
            warn!("connection handshake timed out");
            finish(&connection, on_closed);
            return;
        },
    };

    let started = tokio::select! {
        () = connection.cancel.cancelled() => return,
        started = MuxConnection::start_server(stream, connection.id(), settings) => started,
    };
    let (mux, mut incoming) = match started {
        Ok(started) => started,
        Err(e) => {
            warn!(error = %e, "mux handshake failed");
            finish(&connection, on_closed);
            return;
        },
    };
    if !connection.attach(&mux) {
        mux.shutdown();
        return;
    }

    let security = Arc::new(security);
    info!(suite = security.suite().name, client = ?security.client(), "connection established");

    while let Some(session) = incoming.recv().await {
        if !mux.mark_dispatched(session.handle.id()) {
            continue;
        }
        let request = InboundRequest {
            session,
            security: Arc::clone(&security),
            connection: connection.id(),
        };
        let dispatcher = Arc::clone(&manager.dispatcher);
        settings.runtime.spawn(
            async move { dispatcher.dispatch(request).await }.in_current_span(),
        );
    }

    mux.shutdown();
    finish(&connection, on_closed);
}

fn finish<F: FnOnce(u64)>(connection: &ServerConnection, on_closed: F) {
    if connection.close_self() {
        debug!("connection finished");
        on_closed(connection.id());
    }
}
