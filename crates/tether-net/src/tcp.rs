//! Plain TCP client endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_core::{NegotiationError, RequestHandle};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::client::ConnectionEndpoint;
use crate::connection::{connect_budget, tune_socket, StreamConnection};
use crate::context::SecurityContext;
use crate::error::{TransportError, TransportResult};
use crate::socket_factory::SocketFactory;

/// Resolves `host` and connects to the first address that accepts.
pub(crate) async fn dial(
    factory: &dyn SocketFactory,
    host: &str,
    port: u16,
) -> TransportResult<(TcpStream, SocketAddr)> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        match factory.connect(addr).await {
            Ok(stream) => {
                tune_socket(&stream);
                return Ok((stream, addr));
            },
            Err(e) => {
                trace!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            },
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}")))
        .into())
}

/// Connects to one `host:port` without a security layer.
#[derive(Debug)]
pub struct TcpEndpoint {
    host: String,
    port: u16,
    factory: Arc<dyn SocketFactory>,
    connect_timeout: Duration,
}

impl TcpEndpoint {
    /// Creates an endpoint. `connect_timeout` bounds each connect unless a
    /// request constraint is stricter.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        factory: Arc<dyn SocketFactory>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            factory,
            connect_timeout,
        }
    }

    /// Target host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl ConnectionEndpoint for TcpEndpoint {
    async fn connect(&self, handle: &RequestHandle) -> TransportResult<StreamConnection> {
        let budget = connect_budget(handle.constraints(), self.connect_timeout)?;
        let (stream, peer) = timeout(budget, dial(&*self.factory, &self.host, self.port))
            .await
            .map_err(|_| TransportError::timeout("tcp connect"))??;
        debug!(%peer, "tcp connection established");
        Ok(StreamConnection::new(
            Box::new(stream),
            SecurityContext::plaintext(Some(peer)),
        ))
    }

    fn check_constraints(&self, handle: &RequestHandle) -> Result<(), NegotiationError> {
        SecurityContext::plaintext(None)
            .unfulfilled(handle.constraints())
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use tether_core::{Constraint, ConstraintSet, Toggle};
    use tokio::net::TcpListener;

    use super::*;
    use crate::socket_factory::DefaultSocketFactory;

    fn factory() -> Arc<dyn SocketFactory> {
        Arc::new(DefaultSocketFactory::default())
    }

    #[tokio::test]
    async fn test_connect_plaintext() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = TcpEndpoint::new("localhost", port, factory(), Duration::from_secs(5));

        let handle = RequestHandle::unconstrained();
        let (connection, accepted) = tokio::join!(
            endpoint.connect(&handle),
            listener.accept()
        );
        let connection = connection.unwrap();
        accepted.unwrap();
        assert_eq!(connection.peer_addr().map(|a| a.port()), Some(port));
        assert_eq!(connection.security().suite().name, "PLAINTEXT");
    }

    #[tokio::test]
    async fn test_connect_refused_is_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = TcpEndpoint::new("127.0.0.1", port, factory(), Duration::from_secs(5));
        let result = endpoint.connect(&RequestHandle::unconstrained()).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_plaintext_constraints() {
        let endpoint = TcpEndpoint::new("127.0.0.1", 1, factory(), Duration::from_secs(5));
        let confidential = RequestHandle::new(ConstraintSet::required([
            Constraint::Confidentiality(Toggle::Yes),
        ]));
        assert!(endpoint.check_constraints(&confidential).is_err());

        let anonymous = RequestHandle::new(ConstraintSet::required([
            Constraint::ClientAuthentication(Toggle::No),
        ]));
        assert!(endpoint.check_constraints(&anonymous).is_ok());
    }
}
