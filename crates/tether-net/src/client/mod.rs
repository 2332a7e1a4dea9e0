//! Client side: pooled multiplexed connections.
//!
//! A [`ConnectionManager`] owns the connections to one logical endpoint.
//! Requests borrow a session on a pooled connection with spare capacity, or
//! on a fresh connection when the endpoint declines to reuse one. Idle
//! connections are closed by the runtime's [`Reaper`].

mod reaper;

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
pub use reaper::{ReapOutcome, Reapable, Reaper};
use tether_core::{ConstraintSet, NegotiationError, RequestHandle};
use tokio::sync::OnceCell;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::StreamConnection;
use crate::error::{TransportError, TransportResult};
use crate::mux::{MuxConnection, MuxSession, MuxSettings, SessionReader, SessionStatus, SessionWriter};

/// Creates and selects connections for a [`ConnectionManager`].
#[async_trait]
pub trait ConnectionEndpoint: Send + Sync + 'static {
    /// Opens a new connection suitable for `handle`.
    async fn connect(&self, handle: &RequestHandle) -> TransportResult<StreamConnection>;

    /// Picks a pooled connection for `handle`, or `None` to create one.
    ///
    /// `active` connections carry at least one session and have spare
    /// capacity; `idle` connections carry none. The default takes the first
    /// connection whose security context can meet the handle's constraints,
    /// preferring active ones.
    fn choose(
        &self,
        handle: &RequestHandle,
        active: &[Arc<StreamConnection>],
        idle: &[Arc<StreamConnection>],
    ) -> Option<Arc<StreamConnection>> {
        active
            .iter()
            .chain(idle)
            .find(|connection| connection.security().supports(handle.constraints()))
            .cloned()
    }

    /// Fails fast if no connection from this endpoint could meet the
    /// handle's constraints.
    ///
    /// # Errors
    ///
    /// Returns the negotiation failure.
    fn check_constraints(&self, _handle: &RequestHandle) -> Result<(), NegotiationError> {
        Ok(())
    }

    /// Writes connection-level framing ahead of the request body.
    async fn write_request_data(
        &self,
        _connection: &StreamConnection,
        _handle: &RequestHandle,
        _writer: &mut SessionWriter,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Consumes connection-level framing ahead of the response body.
    async fn read_response_data(
        &self,
        _connection: &StreamConnection,
        _handle: &RequestHandle,
        _reader: &mut SessionReader,
    ) -> io::Result<()> {
        Ok(())
    }
}

/// A pooled connection and its lazily started mux layer.
#[derive(Debug)]
pub struct PooledConnection {
    connection: Arc<StreamConnection>,
    mux: OnceCell<MuxConnection>,
}

impl PooledConnection {
    fn new(connection: Arc<StreamConnection>) -> Self {
        Self {
            connection,
            mux: OnceCell::new(),
        }
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Arc<StreamConnection> {
        &self.connection
    }

    fn is_usable(&self) -> bool {
        !self.connection.is_closed() && self.mux.get().map_or(true, MuxConnection::is_usable)
    }

    fn capacity(&self, default: u32) -> usize {
        self.mux.get().map_or(default, MuxConnection::max_sessions) as usize
    }

    /// Closes the mux layer, if started, and the connection.
    pub fn shutdown(&self) {
        if let Some(mux) = self.mux.get() {
            mux.shutdown();
        }
        self.connection.close();
    }
}

struct PoolEntry {
    pooled: Arc<PooledConnection>,
    sessions: usize,
    idle_since: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    pending_connects: usize,
    shut_down: bool,
}

impl PoolState {
    fn take_unusable(&mut self) -> Vec<Arc<PooledConnection>> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            let usable = entry.pooled.is_usable();
            if !usable {
                removed.push(Arc::clone(&entry.pooled));
            }
            usable
        });
        removed
    }
}

struct ManagerInner {
    id: Uuid,
    endpoint: Arc<dyn ConnectionEndpoint>,
    settings: MuxSettings,
    reaper: Reaper,
    state: Mutex<PoolState>,
}

/// Pool of multiplexed connections to one endpoint.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.inner.id)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager. It registers with `reaper` once it holds a
    /// connection.
    #[must_use]
    pub fn new(endpoint: Arc<dyn ConnectionEndpoint>, settings: MuxSettings, reaper: Reaper) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                id: Uuid::new_v4(),
                endpoint,
                settings,
                reaper,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Manager id, used for reaper registration.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Starts a request. Each [`OutboundRequestIterator::next`] call is one
    /// attempt.
    #[must_use]
    pub fn new_request(&self, handle: RequestHandle) -> OutboundRequestIterator {
        OutboundRequestIterator {
            manager: self.clone(),
            handle,
            attempted: false,
            retry: false,
            last: None,
        }
    }

    /// Pooled connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Closes every pooled connection and leaves the reaper.
    pub fn shutdown(&self) {
        let entries = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            std::mem::take(&mut state.entries)
        };
        self.inner.reaper.unregister(self.inner.id);
        debug!(manager = %self.inner.id, connections = entries.len(), "connection manager shut down");
        for entry in entries {
            entry.pooled.shutdown();
        }
    }

    async fn attempt(&self, handle: &RequestHandle) -> TransportResult<OutboundRequest> {
        let inner = &self.inner;
        inner.endpoint.check_constraints(handle)?;
        let lease = inner.acquire(handle).await?;
        let residual = lease.pooled.connection.security().unfulfilled(handle.constraints())?;

        match inner.open_session(&lease.pooled, handle).await {
            Ok(session) => Ok(OutboundRequest {
                session,
                connection: Arc::clone(&lease.pooled.connection),
                handle: handle.clone(),
                endpoint: Arc::clone(&inner.endpoint),
                residual,
                response_framing_read: false,
                _lease: lease,
            }),
            Err(e) => {
                warn!(connection = lease.pooled.id(), error = %e, "dropping connection after failed session start");
                inner.discard(lease.pooled.id());
                Err(e)
            },
        }
    }

    #[cfg(test)]
    fn reapable(&self) -> &dyn Reapable {
        &*self.inner
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Reserves a session slot on a pooled or new connection.
    async fn acquire(self: &Arc<Self>, handle: &RequestHandle) -> TransportResult<SessionLease> {
        let (chosen, stale) = {
            let mut state = self.lock();
            if state.shut_down {
                return Err(TransportError::Closed {
                    component: "connection manager",
                });
            }
            let stale = state.take_unusable();
            let default_max = self.settings.max_sessions;

            let mut active = Vec::new();
            let mut idle = Vec::new();
            for entry in &state.entries {
                let connection = Arc::clone(&entry.pooled.connection);
                if entry.sessions == 0 {
                    idle.push(connection);
                } else if entry.sessions < entry.pooled.capacity(default_max) {
                    active.push(connection);
                }
            }

            let chosen = self
                .endpoint
                .choose(handle, &active, &idle)
                .and_then(|choice| {
                    state.entries.iter_mut().find(|entry| {
                        entry.pooled.id() == choice.id()
                            && entry.sessions < entry.pooled.capacity(default_max)
                    })
                })
                .map(|entry| {
                    entry.sessions += 1;
                    entry.idle_since = None;
                    Arc::clone(&entry.pooled)
                });
            if chosen.is_none() {
                state.pending_connects += 1;
            }
            (chosen, stale)
        };
        for pooled in stale {
            debug!(connection = pooled.id(), "dropping unusable connection");
            pooled.shutdown();
        }
        if let Some(pooled) = chosen {
            return Ok(SessionLease::new(Arc::clone(self), pooled));
        }

        let pending = PendingConnect(Arc::clone(self));
        let connection = Arc::new(self.endpoint.connect(handle).await?);
        let pooled = Arc::new(PooledConnection::new(connection));
        {
            let mut state = self.lock();
            if state.shut_down {
                drop(state);
                pooled.shutdown();
                return Err(TransportError::Closed {
                    component: "connection manager",
                });
            }
            state.entries.push(PoolEntry {
                pooled: Arc::clone(&pooled),
                sessions: 1,
                idle_since: None,
            });
        }
        drop(pending);
        debug!(
            manager = %self.id,
            connection = pooled.id(),
            peer = ?pooled.connection.peer_addr(),
            "new pooled connection"
        );
        let reapable: Arc<dyn Reapable> = Arc::clone(self) as Arc<dyn Reapable>;
        self.reaper.register(self.id, Arc::downgrade(&reapable));
        Ok(SessionLease::new(Arc::clone(self), pooled))
    }

    async fn open_session(
        &self,
        pooled: &PooledConnection,
        handle: &RequestHandle,
    ) -> TransportResult<MuxSession> {
        let mux = pooled
            .mux
            .get_or_try_init(|| async {
                let stream = pooled.connection.take_stream()?;
                MuxConnection::start_client(stream, pooled.id(), &self.settings)
                    .await
                    .map_err(TransportError::from)
            })
            .await?;
        let mut session = mux.open().await?;
        if let Err(e) = self
            .endpoint
            .write_request_data(&pooled.connection, handle, &mut session.writer)
            .await
        {
            session.handle.abort(false);
            return Err(e.into());
        }
        Ok(session)
    }

    fn release(&self, connection: u64) {
        let mut state = self.lock();
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.pooled.id() == connection)
        {
            entry.sessions = entry.sessions.saturating_sub(1);
            if entry.sessions == 0 {
                entry.idle_since = Some(Instant::now());
            }
        }
    }

    fn discard(&self, connection: u64) {
        let removed = {
            let mut state = self.lock();
            state
                .entries
                .iter()
                .position(|entry| entry.pooled.id() == connection)
                .map(|index| state.entries.remove(index))
        };
        if let Some(entry) = removed {
            entry.pooled.shutdown();
        }
    }
}

impl Reapable for ManagerInner {
    fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> ReapOutcome {
        let mut state = self.lock();
        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(state.entries.len());
        for mut entry in state.entries.drain(..) {
            if !entry.pooled.is_usable() {
                evicted.push(entry.pooled);
                continue;
            }
            if entry.sessions > 0 {
                entry.idle_since = None;
                kept.push(entry);
                continue;
            }
            match entry.idle_since {
                None => {
                    entry.idle_since = Some(now);
                    kept.push(entry);
                },
                Some(mark) if now.saturating_duration_since(mark) > idle_timeout => {
                    evicted.push(entry.pooled);
                },
                Some(_) => kept.push(entry),
            }
        }
        state.entries = kept;
        let keep = !state.shut_down && (!state.entries.is_empty() || state.pending_connects > 0);
        ReapOutcome { evicted, keep }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let Ok(state) = self.state.get_mut() else {
            return;
        };
        for entry in state.entries.drain(..) {
            entry.pooled.shutdown();
        }
    }
}

/// Holds the pending-connect count for the duration of a connect.
struct PendingConnect(Arc<ManagerInner>);

impl Drop for PendingConnect {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.pending_connects = state.pending_connects.saturating_sub(1);
    }
}

/// One reserved session slot on a pooled connection.
struct SessionLease {
    manager: Arc<ManagerInner>,
    pooled: Arc<PooledConnection>,
}

impl SessionLease {
    const fn new(manager: Arc<ManagerInner>, pooled: Arc<PooledConnection>) -> Self {
        Self { manager, pooled }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.manager.release(self.pooled.id());
    }
}

/// Attempts of one logical request.
///
/// The first attempt is always allowed; a further attempt only after the
/// previous one was refused by a server shutting down gracefully.
pub struct OutboundRequestIterator {
    manager: ConnectionManager,
    handle: RequestHandle,
    attempted: bool,
    retry: bool,
    last: Option<Arc<SessionStatus>>,
}

impl OutboundRequestIterator {
    /// Returns `true` if another attempt may be made.
    #[must_use]
    pub fn has_next(&self) -> bool {
        !self.attempted
            || self.retry
            || self
                .last
                .as_ref()
                .is_some_and(|status| status.should_retry())
    }

    /// Makes the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedConstraints`] if the handle's
    /// constraints cannot be met, [`TransportError::Closed`] if no attempt
    /// is left, or the connection failure.
    pub async fn next(&mut self) -> TransportResult<OutboundRequest> {
        if !self.has_next() {
            return Err(TransportError::Closed {
                component: "request iterator",
            });
        }
        self.attempted = true;
        self.retry = false;
        self.last = None;

        match self.manager.attempt(&self.handle).await {
            Ok(request) => {
                self.last = Some(Arc::clone(request.session.handle.status()));
                Ok(request)
            },
            Err(e) => {
                self.retry = e.is_graceful_shutdown();
                Err(e)
            },
        }
    }

    /// The request handle.
    #[must_use]
    pub const fn handle(&self) -> &RequestHandle {
        &self.handle
    }
}

/// One attempt of a request: a session on a pooled connection.
pub struct OutboundRequest {
    session: MuxSession,
    connection: Arc<StreamConnection>,
    handle: RequestHandle,
    endpoint: Arc<dyn ConnectionEndpoint>,
    residual: ConstraintSet,
    response_framing_read: bool,
    _lease: SessionLease,
}

impl std::fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("request", &self.handle.id())
            .field("connection", &self.connection.id())
            .field("session", &self.session.handle.id())
            .finish_non_exhaustive()
    }
}

impl OutboundRequest {
    /// Stream for the request body.
    pub fn request_writer(&mut self) -> &mut SessionWriter {
        &mut self.session.writer
    }

    /// Stream for the response body.
    ///
    /// The first call consumes the endpoint's response framing.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from reading the response framing.
    pub async fn response(&mut self) -> TransportResult<&mut SessionReader> {
        if !self.response_framing_read {
            self.response_framing_read = true;
            self.endpoint
                .read_response_data(&self.connection, &self.handle, &mut self.session.reader)
                .await?;
        }
        Ok(&mut self.session.reader)
    }

    /// Constraints the connection left for the RPC layer to satisfy.
    #[must_use]
    pub const fn unfulfilled_constraints(&self) -> &ConstraintSet {
        &self.residual
    }

    /// Delivery state of the request.
    #[must_use]
    pub fn delivery_status(&self) -> &Arc<SessionStatus> {
        self.session.handle.status()
    }

    /// Returns `true` if the server refused the request undelivered.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.delivery_status().should_retry()
    }

    /// Connection the request runs on.
    #[must_use]
    pub const fn connection(&self) -> &Arc<StreamConnection> {
        &self.connection
    }

    /// Aborts the request. Best effort.
    pub fn abort(&self) {
        self.session.handle.abort(true);
    }
}
