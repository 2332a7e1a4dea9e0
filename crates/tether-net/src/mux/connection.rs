//! Connection drivers: handshake, frame routing and session bookkeeping.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::codec::{Frame, FrameCodec, VERSION};
use super::session::{MuxSession, SessionHandle, SessionReader, SessionStatus, SessionWriter};
use super::{MuxError, MuxSettings};
use crate::connection::BoxedStream;

type Transport = Framed<BoxedStream, FrameCodec>;

/// Data frames queued per connection before writers wait.
const DATA_QUEUE: usize = 256;

/// Inbound `DATA` payloads buffered per session before the connection stops
/// reading from the socket.
const SESSION_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

#[derive(Debug)]
enum Phase {
    Open,
    Draining { reason: String },
    Closed,
}

/// Reader-side state of a session. Removed once both directions finished
/// or the session was aborted.
struct Slot {
    inbound: Option<mpsc::Sender<Bytes>>,
    /// Cancelled when the slot is dropped, releasing a delivery that waits
    /// for room in the session's buffer.
    released: CancellationToken,
    status: Arc<SessionStatus>,
    dispatched: bool,
    local_closed: bool,
}

impl Slot {
    fn fail(&self, kind: io::ErrorKind, message: impl Into<String>) {
        self.status.fail(kind, message);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.released.cancel();
    }
}

/// A `DATA` payload on its way to a session.
struct Delivery {
    session: u32,
    payload: Bytes,
    inbound: mpsc::Sender<Bytes>,
    released: CancellationToken,
}

impl Delivery {
    /// Waits for room in the session's buffer. Returns `false` if the
    /// connection was cancelled first.
    async fn complete(self, cancel: &CancellationToken) -> bool {
        let Self {
            session,
            payload,
            inbound,
            released,
        } = self;
        tokio::select! {
            () = cancel.cancelled() => false,
            () = released.cancelled() => {
                trace!(session, "data for released session dropped");
                true
            },
            sent = inbound.send(payload) => {
                if sent.is_err() {
                    trace!(session, "session reader gone, data dropped");
                }
                true
            },
        }
    }
}

struct State {
    phase: Phase,
    next_local_id: u32,
    last_remote_id: u32,
    last_dispatched: u32,
    slots: HashMap<u32, Slot>,
}

pub(crate) struct Shared {
    role: Role,
    connection_id: u64,
    max_sessions: u32,
    data_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    runtime: Handle,
    state: Mutex<State>,
}

/// A multiplexed connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct MuxConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("connection", &self.shared.connection_id)
            .field("role", &self.shared.role)
            .field("max_sessions", &self.shared.max_sessions)
            .finish_non_exhaustive()
    }
}

impl MuxConnection {
    /// Runs the client side of the handshake and starts the drivers.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::HandshakeTimeout`] if the server does not answer
    /// in time, or the handshake failure.
    pub async fn start_client(
        stream: BoxedStream,
        connection_id: u64,
        settings: &MuxSettings,
    ) -> Result<Self, MuxError> {
        let mut transport = Framed::new(stream, FrameCodec);
        let peer_max = timeout(
            settings.handshake_timeout,
            client_handshake(&mut transport, settings.max_sessions),
        )
        .await
        .map_err(|_| MuxError::HandshakeTimeout)??;

        let max_sessions = settings.max_sessions.min(peer_max);
        debug!(connection = connection_id, max_sessions, "mux handshake complete");
        Ok(Self::spawn(
            Role::Client,
            transport,
            connection_id,
            max_sessions,
            settings,
            None,
        ))
    }

    /// Runs the server side of the handshake and starts the drivers.
    ///
    /// Sessions opened by the client arrive on the returned receiver.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::HandshakeTimeout`] if the client does not greet
    /// in time, or the handshake failure.
    pub async fn start_server(
        stream: BoxedStream,
        connection_id: u64,
        settings: &MuxSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MuxSession>), MuxError> {
        let mut transport = Framed::new(stream, FrameCodec);
        let peer_max = timeout(
            settings.handshake_timeout,
            server_handshake(&mut transport, settings.max_sessions),
        )
        .await
        .map_err(|_| MuxError::HandshakeTimeout)??;

        let max_sessions = settings.max_sessions.min(peer_max);
        debug!(connection = connection_id, max_sessions, "mux handshake complete");
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let connection = Self::spawn(
            Role::Server,
            transport,
            connection_id,
            max_sessions,
            settings,
            Some(incoming_tx),
        );
        Ok((connection, incoming_rx))
    }

    fn spawn(
        role: Role,
        transport: Transport,
        connection_id: u64,
        max_sessions: u32,
        settings: &MuxSettings,
        incoming: Option<mpsc::UnboundedSender<MuxSession>>,
    ) -> Self {
        let (sink, stream) = transport.split();
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            role,
            connection_id,
            max_sessions,
            data_tx,
            control_tx,
            cancel: CancellationToken::new(),
            runtime: settings.runtime.clone(),
            state: Mutex::new(State {
                phase: Phase::Open,
                next_local_id: 1,
                last_remote_id: 0,
                last_dispatched: 0,
                slots: HashMap::new(),
            }),
        });

        let span = debug_span!("mux", connection = connection_id, role = ?role);
        settings.runtime.spawn(
            write_loop(
                sink,
                data_rx,
                control_rx,
                shared.cancel.clone(),
                settings.handshake_timeout,
            )
            .instrument(span.clone()),
        );
        settings
            .runtime
            .spawn(read_loop(Arc::clone(&shared), stream, incoming).instrument(span));
        Self { shared }
    }

    /// Opens a new session.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Shutdown`] if the peer is draining the
    /// connection, [`MuxError::SessionIdsExhausted`] once the id space is
    /// used up, and [`MuxError::ConnectionClosed`] after failure.
    pub async fn open(&self) -> Result<MuxSession, MuxError> {
        let session = {
            let mut state = self.shared.lock();
            match &state.phase {
                Phase::Open => {},
                Phase::Draining { reason } => {
                    return Err(MuxError::Shutdown {
                        reason: reason.clone(),
                    })
                },
                Phase::Closed => return Err(MuxError::ConnectionClosed),
            }
            if self.shared.role != Role::Client {
                return Err(MuxError::protocol_violation("servers do not open sessions"));
            }
            if state.next_local_id == u32::MAX {
                return Err(MuxError::SessionIdsExhausted);
            }
            let id = state.next_local_id;
            state.next_local_id += 1;
            self.shared.new_session(&mut state, id)
        };

        let open = Frame::Open {
            session: session.handle.id(),
        };
        if self.shared.data_tx.send(open).await.is_err() {
            session.handle.abort(false);
            return Err(MuxError::ConnectionClosed);
        }
        trace!(session = session.handle.id(), "session opened");
        Ok(session)
    }

    /// Marks a server session as handed to the dispatcher.
    ///
    /// Returns `false` if the session is gone or the connection is
    /// draining; such a session must not be dispatched.
    #[must_use]
    pub fn mark_dispatched(&self, session: u32) -> bool {
        let mut state = self.shared.lock();
        if !matches!(state.phase, Phase::Open) {
            return false;
        }
        match state.slots.get_mut(&session) {
            Some(slot) => {
                slot.dispatched = true;
                state.last_dispatched = state.last_dispatched.max(session);
                true
            },
            None => false,
        }
    }

    /// Announces a graceful shutdown to the peer and closes the connection.
    ///
    /// Undispatched sessions are aborted as not delivered so the client can
    /// retry them elsewhere; dispatched sessions are aborted as delivered.
    pub fn graceful_shutdown(&self, reason: &str) {
        {
            let mut state = self.shared.lock();
            if !matches!(state.phase, Phase::Open) {
                drop(state);
                self.shared.cancel.cancel();
                return;
            }
            state.phase = Phase::Draining {
                reason: reason.to_string(),
            };
            let _ = self.shared.control_tx.send(Frame::Shutdown {
                last_session: state.last_dispatched,
                reason: reason.to_string(),
            });
            for (id, slot) in state.slots.drain() {
                slot.status.mark_aborted();
                if !slot.dispatched {
                    slot.status.mark_not_delivered();
                }
                let _ = self.shared.control_tx.send(Frame::Abort {
                    session: id,
                    delivered: slot.dispatched,
                });
                slot.fail(
                    io::ErrorKind::ConnectionAborted,
                    format!("connection closing: {reason}"),
                );
            }
        }
        info!(connection = self.shared.connection_id, %reason, "mux connection draining");
        self.shared.cancel.cancel();
    }

    /// Closes the connection immediately, failing every open session.
    pub fn shutdown(&self) {
        self.shared.terminate(None);
    }

    /// Returns `true` if new sessions can be opened.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        let state = self.shared.lock();
        matches!(state.phase, Phase::Open)
            && state.next_local_id < u32::MAX
            && !self.shared.cancel.is_cancelled()
    }

    /// Returns `true` once the drivers have stopped or been told to stop.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Negotiated session limit.
    #[must_use]
    pub fn max_sessions(&self) -> u32 {
        self.shared.max_sessions
    }

    #[cfg(test)]
    pub(crate) fn skip_session_ids(&self, next: u32) {
        self.shared.lock().next_local_id = next;
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("lock poisoned")
    }

    fn new_session(self: &Arc<Self>, state: &mut State, id: u32) -> MuxSession {
        let (inbound_tx, inbound_rx) = mpsc::channel(SESSION_WINDOW);
        let status = Arc::new(SessionStatus::new());
        state.slots.insert(
            id,
            Slot {
                inbound: Some(inbound_tx),
                released: CancellationToken::new(),
                status: Arc::clone(&status),
                dispatched: false,
                local_closed: false,
            },
        );
        MuxSession {
            handle: SessionHandle::new(id, Arc::clone(&status), Arc::downgrade(self)),
            reader: SessionReader::new(inbound_rx, Arc::clone(&status)),
            writer: SessionWriter::new(
                id,
                self.data_tx.clone(),
                status,
                Arc::downgrade(self),
                self.runtime.clone(),
            ),
        }
    }

    /// The local writer sent `CLOSE` or was dropped.
    pub(super) fn finish_local(&self, id: u32) {
        let mut state = self.lock();
        let done = match state.slots.get_mut(&id) {
            Some(slot) => {
                slot.local_closed = true;
                slot.inbound.is_none()
            },
            None => false,
        };
        if done {
            state.slots.remove(&id);
        }
    }

    pub(super) fn abort_session(&self, id: u32, delivered: bool) {
        let slot = self.lock().slots.remove(&id);
        if let Some(slot) = slot {
            slot.fail(io::ErrorKind::ConnectionAborted, "session aborted");
        }
        if self.cancel.is_cancelled() {
            return;
        }
        let abort = Frame::Abort {
            session: id,
            delivered,
        };
        if let Err(mpsc::error::TrySendError::Full(abort)) = self.data_tx.try_send(abort) {
            let _ = self.control_tx.send(abort);
        }
    }

    /// Applies one inbound frame. `DATA` is returned as a [`Delivery`] for
    /// the read loop to wait on, outside the state lock.
    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        incoming: Option<&mpsc::UnboundedSender<MuxSession>>,
    ) -> Result<Option<Delivery>, MuxError> {
        match frame {
            Frame::Data { session, payload } => {
                let state = self.lock();
                let Some(slot) = state.slots.get(&session) else {
                    trace!(session, "data for closed session dropped");
                    return Ok(None);
                };
                let Some(inbound) = &slot.inbound else {
                    trace!(session, "data after peer close dropped");
                    return Ok(None);
                };
                return Ok(Some(Delivery {
                    session,
                    payload,
                    inbound: inbound.clone(),
                    released: slot.released.clone(),
                }));
            },
            Frame::Close { session } => {
                let mut state = self.lock();
                let done = match state.slots.get_mut(&session) {
                    Some(slot) => {
                        slot.inbound = None;
                        slot.local_closed
                    },
                    None => false,
                };
                if done {
                    state.slots.remove(&session);
                }
            },
            Frame::Abort { session, delivered } => {
                let slot = self.lock().slots.remove(&session);
                if let Some(slot) = slot {
                    slot.status.mark_aborted();
                    if !delivered && self.role == Role::Client {
                        slot.status.mark_not_delivered();
                    }
                    slot.fail(
                        io::ErrorKind::ConnectionAborted,
                        if delivered {
                            "session aborted by peer"
                        } else {
                            "session aborted by peer before dispatch"
                        },
                    );
                }
            },
            Frame::Open { session } => self.accept_open(session, incoming)?,
            Frame::Shutdown {
                last_session,
                reason,
            } => self.peer_shutdown(last_session, &reason),
            Frame::Hello { .. } | Frame::HelloAck { .. } => {
                return Err(MuxError::protocol_violation(
                    "handshake frame after handshake",
                ));
            },
        }
        Ok(None)
    }

    fn accept_open(
        self: &Arc<Self>,
        session: u32,
        incoming: Option<&mpsc::UnboundedSender<MuxSession>>,
    ) -> Result<(), MuxError> {
        let Some(incoming) = incoming.filter(|_| self.role == Role::Server) else {
            return Err(MuxError::protocol_violation("OPEN sent to a client"));
        };

        let mut state = self.lock();
        if session <= state.last_remote_id {
            return Err(MuxError::protocol_violation(format!(
                "session id {session} not increasing"
            )));
        }
        state.last_remote_id = session;

        let at_capacity = state.slots.len() >= self.max_sessions as usize;
        if !matches!(state.phase, Phase::Open) || at_capacity {
            debug!(session, at_capacity, "refusing session");
            let _ = self.control_tx.send(Frame::Abort {
                session,
                delivered: false,
            });
            return Ok(());
        }

        let accepted = self.new_session(&mut state, session);
        drop(state);
        if let Err(mpsc::error::SendError(rejected)) = incoming.send(accepted) {
            rejected.handle.abort(false);
        }
        Ok(())
    }

    fn peer_shutdown(&self, last_session: u32, reason: &str) {
        let mut state = self.lock();
        if matches!(state.phase, Phase::Open) {
            state.phase = Phase::Draining {
                reason: reason.to_string(),
            };
        }
        if self.role == Role::Client {
            let undelivered: Vec<u32> = state
                .slots
                .keys()
                .copied()
                .filter(|id| *id > last_session)
                .collect();
            for id in undelivered {
                if let Some(slot) = state.slots.remove(&id) {
                    slot.status.mark_aborted();
                    slot.status.mark_not_delivered();
                    slot.fail(
                        io::ErrorKind::ConnectionAborted,
                        format!("request not delivered: {reason}"),
                    );
                }
            }
        }
        info!(last_session, %reason, "peer shutting down");
    }

    fn terminate(&self, cause: Option<&MuxError>) {
        let slots = {
            let mut state = self.lock();
            state.phase = Phase::Closed;
            std::mem::take(&mut state.slots)
        };
        let (kind, message) = match cause {
            None => (io::ErrorKind::ConnectionAborted, "connection shut down".to_string()),
            Some(MuxError::ConnectionClosed) => (
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer".to_string(),
            ),
            Some(e) => (io::ErrorKind::ConnectionReset, e.to_string()),
        };
        for slot in slots.into_values() {
            slot.fail(kind, message.clone());
        }
        self.cancel.cancel();
    }
}

async fn client_handshake(transport: &mut Transport, max_sessions: u32) -> Result<u32, MuxError> {
    transport
        .send(Frame::Hello {
            version: VERSION,
            max_sessions,
        })
        .await?;
    match transport.next().await {
        Some(Ok(Frame::HelloAck {
            version,
            max_sessions,
        })) => check_peer(version, max_sessions),
        Some(Ok(_)) => Err(MuxError::handshake("expected HELLO_ACK")),
        Some(Err(e)) => Err(e),
        None => Err(MuxError::ConnectionClosed),
    }
}

async fn server_handshake(transport: &mut Transport, max_sessions: u32) -> Result<u32, MuxError> {
    let peer_max = match transport.next().await {
        Some(Ok(Frame::Hello {
            version,
            max_sessions,
        })) => check_peer(version, max_sessions)?,
        Some(Ok(_)) => return Err(MuxError::handshake("expected HELLO")),
        Some(Err(e)) => return Err(e),
        None => return Err(MuxError::ConnectionClosed),
    };
    transport
        .send(Frame::HelloAck {
            version: VERSION,
            max_sessions,
        })
        .await?;
    Ok(peer_max)
}

fn check_peer(version: u8, max_sessions: u32) -> Result<u32, MuxError> {
    if version != VERSION {
        return Err(MuxError::VersionMismatch {
            reason: format!("peer version {version}, local version {VERSION}"),
        });
    }
    if max_sessions == 0 {
        return Err(MuxError::handshake("peer allows no sessions"));
    }
    Ok(max_sessions)
}

fn next_ready(
    control: &mut mpsc::UnboundedReceiver<Frame>,
    data: &mut mpsc::Receiver<Frame>,
) -> Option<Frame> {
    control.try_recv().ok().or_else(|| data.try_recv().ok())
}

async fn pump(
    sink: &mut SplitSink<Transport, Frame>,
    data: &mut mpsc::Receiver<Frame>,
    control: &mut mpsc::UnboundedReceiver<Frame>,
    cancel: &CancellationToken,
) -> Result<(), MuxError> {
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control.recv() => frame,
            Some(frame) = data.recv() => frame,
            () = cancel.cancelled() => return Ok(()),
            else => return Ok(()),
        };
        sink.feed(frame).await?;
        while let Some(frame) = next_ready(control, data) {
            sink.feed(frame).await?;
        }
        sink.flush().await?;
    }
}

async fn write_loop(
    mut sink: SplitSink<Transport, Frame>,
    mut data: mpsc::Receiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
    linger: Duration,
) {
    if let Err(e) = pump(&mut sink, &mut data, &mut control, &cancel).await {
        debug!(error = %e, "mux writer failed");
        cancel.cancel();
    }

    let drained = timeout(linger, async {
        while let Some(frame) = next_ready(&mut control, &mut data) {
            sink.feed(frame).await?;
        }
        sink.close().await
    })
    .await;
    match drained {
        Ok(Ok(())) => trace!("mux writer closed"),
        Ok(Err(e)) => trace!(error = %e, "mux writer close failed"),
        Err(_) => warn!("mux writer did not drain in time"),
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut stream: SplitStream<Transport>,
    incoming: Option<mpsc::UnboundedSender<MuxSession>>,
) {
    let outcome = loop {
        let next = tokio::select! {
            () = shared.cancel.cancelled() => break Ok(()),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(frame)) => match shared.handle_frame(frame, incoming.as_ref()) {
                Ok(Some(delivery)) => {
                    if !delivery.complete(&shared.cancel).await {
                        break Ok(());
                    }
                },
                Ok(None) => {},
                Err(e) => break Err(e),
            },
            Some(Err(e)) => break Err(e),
            None => break Err(MuxError::ConnectionClosed),
        }
    };

    match &outcome {
        Ok(()) | Err(MuxError::ConnectionClosed) => debug!("mux reader finished"),
        Err(e) if e.is_protocol_violation() => warn!(error = %e, "peer violated the mux protocol"),
        Err(e) => info!(error = %e, "mux connection failed"),
    }
    shared.terminate(outcome.as_ref().err());
}
