//! Socket creation capability.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

/// Creates listening and connected TCP sockets.
///
/// Listen deduplication treats two endpoints as the same only if they share
/// the same factory instance.
#[async_trait]
pub trait SocketFactory: Send + Sync + fmt::Debug + 'static {
    /// Binds a listening socket.
    async fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener>;

    /// Opens a connection.
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Identity of a factory instance, used as part of a listen key.
#[must_use]
pub fn factory_id(factory: &Arc<dyn SocketFactory>) -> usize {
    Arc::as_ptr(factory).cast::<()>() as usize
}

/// Default factory backed by tokio sockets.
///
/// With `prefer_nonblocking_io` unset, sockets are created with blocking
/// std calls on the blocking pool and converted afterwards.
#[derive(Debug, Clone, Copy)]
pub struct DefaultSocketFactory {
    prefer_nonblocking_io: bool,
}

impl DefaultSocketFactory {
    /// Creates a factory.
    #[must_use]
    pub const fn new(prefer_nonblocking_io: bool) -> Self {
        Self {
            prefer_nonblocking_io,
        }
    }
}

impl Default for DefaultSocketFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl SocketFactory for DefaultSocketFactory {
    async fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        if self.prefer_nonblocking_io {
            return TcpListener::bind(addr).await;
        }
        let listener = tokio::task::spawn_blocking(move || std::net::TcpListener::bind(addr))
            .await
            .map_err(io::Error::other)??;
        listener.set_nonblocking(true)?;
        TcpListener::from_std(listener)
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        if self.prefer_nonblocking_io {
            return TcpStream::connect(addr).await;
        }
        let stream = tokio::task::spawn_blocking(move || std::net::TcpStream::connect(addr))
            .await
            .map_err(io::Error::other)??;
        stream.set_nonblocking(true)?;
        TcpStream::from_std(stream)
    }
}
