//! Session halves: the reader and writer streams, the delivery status and
//! the abort handle.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use super::codec::{Frame, MAX_PAYLOAD};
use super::connection::Shared;

/// Delivery state of one session, shared between its halves and the
/// connection driver.
#[derive(Debug)]
pub struct SessionStatus {
    delivered: AtomicBool,
    retry: AtomicBool,
    aborted: AtomicBool,
    failure: Mutex<Option<(io::ErrorKind, String)>>,
}

impl SessionStatus {
    pub(super) const fn new() -> Self {
        Self {
            delivered: AtomicBool::new(true),
            retry: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// `false` once the peer reported the request was never dispatched.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// `true` if the request may be retried on another connection.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// `true` once the session was aborted by either side.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(super) fn mark_not_delivered(&self) {
        self.delivered.store(false, Ordering::Release);
        self.retry.store(true, Ordering::Release);
    }

    /// Returns `true` for the call that aborted the session.
    pub(super) fn mark_aborted(&self) -> bool {
        !self.aborted.swap(true, Ordering::AcqRel)
    }

    /// Records why the inbound side ended abnormally. The first failure
    /// wins. Must be called before the inbound sender is dropped.
    pub(super) fn fail(&self, kind: io::ErrorKind, message: impl Into<String>) {
        let mut failure = self.failure.lock().expect("lock poisoned");
        if failure.is_none() {
            *failure = Some((kind, message.into()));
        }
    }

    fn failure(&self) -> Option<io::Error> {
        self.failure
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }
}

/// Inbound half of a session.
///
/// Buffers a bounded number of `DATA` payloads. While the buffer is full the
/// connection stops reading from the socket, so a slow reader pushes back on
/// its peer.
#[derive(Debug)]
pub struct SessionReader {
    inbound: mpsc::Receiver<Bytes>,
    status: Arc<SessionStatus>,
    chunk: Bytes,
    done: bool,
}

impl SessionReader {
    pub(super) const fn new(inbound: mpsc::Receiver<Bytes>, status: Arc<SessionStatus>) -> Self {
        Self {
            inbound,
            status,
            chunk: Bytes::new(),
            done: false,
        }
    }
}

impl AsyncRead for SessionReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.chunk.is_empty() {
                let n = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..n]);
                this.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.inbound.poll_recv(cx)) {
                Some(bytes) => this.chunk = bytes,
                None => {
                    this.done = true;
                    if let Some(e) = this.status.failure() {
                        return Poll::Ready(Err(e));
                    }
                },
            }
        }
    }
}

/// Outbound half of a session.
///
/// Writes are split into `DATA` frames of at most [`MAX_PAYLOAD`] bytes.
/// Shutting the writer down sends `CLOSE`; dropping it unclosed sends
/// `CLOSE` on a best-effort basis.
pub struct SessionWriter {
    session: u32,
    sender: PollSender<Frame>,
    status: Arc<SessionStatus>,
    mux: Weak<Shared>,
    runtime: Handle,
    closed: bool,
}

impl SessionWriter {
    pub(super) fn new(
        session: u32,
        sender: mpsc::Sender<Frame>,
        status: Arc<SessionStatus>,
        mux: Weak<Shared>,
        runtime: Handle,
    ) -> Self {
        Self {
            session,
            sender: PollSender::new(sender),
            status,
            mux,
            runtime,
            closed: false,
        }
    }

    fn finish(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.finish_local(self.session);
        }
    }
}

impl std::fmt::Debug for SessionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWriter")
            .field("session", &self.session)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn broken_pipe(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, msg)
}

impl AsyncWrite for SessionWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.closed {
            return Poll::Ready(Err(broken_pipe("session write side closed")));
        }
        if this.status.is_aborted() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session aborted",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.sender.poll_reserve(cx)).map_err(|_| broken_pipe("connection closed"))?;
        let n = buf.len().min(MAX_PAYLOAD);
        this.sender
            .send_item(Frame::Data {
                session: this.session,
                payload: Bytes::copy_from_slice(&buf[..n]),
            })
            .map_err(|_| broken_pipe("connection closed"))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.closed || this.status.is_aborted() {
            this.closed = true;
            return Poll::Ready(Ok(()));
        }
        ready!(this.sender.poll_reserve(cx)).map_err(|_| broken_pipe("connection closed"))?;
        this.sender
            .send_item(Frame::Close {
                session: this.session,
            })
            .map_err(|_| broken_pipe("connection closed"))?;
        this.closed = true;
        this.sender.close();
        this.finish();
        Poll::Ready(Ok(()))
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        if self.closed || self.status.is_aborted() {
            return;
        }
        if let Some(sender) = self.sender.get_ref() {
            let close = Frame::Close {
                session: self.session,
            };
            match sender.try_send(close) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {},
                Err(mpsc::error::TrySendError::Full(close)) => {
                    let sender = sender.clone();
                    self.runtime.spawn(async move {
                        let _ = sender.send(close).await;
                    });
                },
            }
        }
        self.finish();
    }
}

/// Identity of a session and the means to abort it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u32,
    status: Arc<SessionStatus>,
    mux: Weak<Shared>,
}

impl SessionHandle {
    pub(super) const fn new(id: u32, status: Arc<SessionStatus>, mux: Weak<Shared>) -> Self {
        Self { id, status, mux }
    }

    /// Session id, unique on its connection.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Delivery state.
    #[must_use]
    pub fn status(&self) -> &Arc<SessionStatus> {
        &self.status
    }

    /// Aborts the session in both directions. Best effort.
    pub fn abort(&self, delivered: bool) {
        if !self.status.mark_aborted() {
            return;
        }
        if let Some(mux) = self.mux.upgrade() {
            mux.abort_session(self.id, delivered);
        }
    }
}

/// One logical session: an independent pair of byte streams.
#[derive(Debug)]
pub struct MuxSession {
    /// Identity and abort handle.
    pub handle: SessionHandle,
    /// Bytes from the peer.
    pub reader: SessionReader,
    /// Bytes to the peer.
    pub writer: SessionWriter,
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_reader_concatenates_chunks_until_eof() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = SessionReader::new(rx, Arc::new(SessionStatus::new()));
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::new()).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_reader_surfaces_failure_after_buffered_data() {
        let (tx, rx) = mpsc::channel(4);
        let status = Arc::new(SessionStatus::new());
        let mut reader = SessionReader::new(rx, Arc::clone(&status));
        tx.send(Bytes::from_static(b"ab")).await.unwrap();
        status.fail(io::ErrorKind::ConnectionAborted, "gone");
        status.fail(io::ErrorKind::UnexpectedEof, "later");
        drop(tx);

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(out, b"ab");
    }

    #[tokio::test]
    async fn test_writer_chunks_and_closes() {
        let (tx, mut rx) = mpsc::channel(16);
        let status = Arc::new(SessionStatus::new());
        let mut writer = SessionWriter::new(5, tx, status, Weak::new(), Handle::current());

        let big = vec![7u8; MAX_PAYLOAD + 10];
        writer.write_all(&big).await.unwrap();
        writer.shutdown().await.unwrap();
        assert!(writer.write_all(b"late").await.is_err());
        drop(writer);

        let mut sizes = Vec::new();
        let mut closes = 0;
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Data { session, payload } => {
                    assert_eq!(session, 5);
                    sizes.push(payload.len());
                },
                Frame::Close { session: 5 } => closes += 1,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(sizes, vec![MAX_PAYLOAD, 10]);
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_dropped_writer_sends_close() {
        let (tx, mut rx) = mpsc::channel(4);
        let writer = SessionWriter::new(
            9,
            tx,
            Arc::new(SessionStatus::new()),
            Weak::new(),
            Handle::current(),
        );
        drop(writer);
        assert_eq!(rx.recv().await, Some(Frame::Close { session: 9 }));
    }

    #[test]
    fn test_status_transitions() {
        let status = SessionStatus::new();
        assert!(status.delivered());
        assert!(!status.should_retry());
        status.mark_not_delivered();
        assert!(!status.delivered());
        assert!(status.should_retry());
        assert!(status.mark_aborted());
        assert!(!status.mark_aborted());
    }
}
