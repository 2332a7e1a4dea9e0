//! Transport runtime: the injected tokio runtime, the idle reaper and the
//! listen registry, shared by every endpoint of a process.

use std::net::SocketAddr;
use std::sync::Arc;

use tether_core::{
    client_candidates, negotiate, CipherCapability, ConstraintSet, ListenAuthorizer, TransportConfig,
};
use tokio::runtime::Handle;
use tracing::info;

use crate::client::{ConnectionEndpoint, ConnectionManager, Reaper};
use crate::error::{TransportError, TransportResult};
use crate::mux::MuxSettings;
use crate::registry::{ListenKey, ListenRegistry};
use crate::server::{
    ConnectionUpgrader, Dispatcher, ListenHandle, ListenOperation, PlaintextUpgrader,
    ServerSessionManager,
};
use crate::socket_factory::{DefaultSocketFactory, SocketFactory};
use crate::tcp::TcpEndpoint;
use crate::tls::{TlsConfig, TlsEndpoint, TlsUpgrader};

/// Which stream layer an endpoint uses.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    Tls(Arc<TlsConfig>),
}

impl Transport {
    fn upgrader(
        &self,
        authorizer: &dyn ListenAuthorizer,
        constraints: &ConstraintSet,
    ) -> TransportResult<Arc<dyn ConnectionUpgrader>> {
        match self {
            Self::Tcp => {
                negotiate(
                    &[CipherCapability::PLAINTEXT],
                    &[],
                    &client_candidates(constraints),
                    constraints,
                )?;
                Ok(Arc::new(PlaintextUpgrader))
            },
            Self::Tls(config) => Ok(Arc::new(TlsUpgrader::for_listen(
                config,
                authorizer,
                constraints,
            )?)),
        }
    }
}

/// Process-wide transport state.
///
/// Every task the transport starts runs on the runtime handle given here.
/// Dropping the runtime does not stop listeners; call
/// [`shutdown`](Self::shutdown).
pub struct TransportRuntime {
    handle: Handle,
    config: TransportConfig,
    factory: Arc<dyn SocketFactory>,
    reaper: Reaper,
    registry: ListenRegistry,
}

impl std::fmt::Debug for TransportRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRuntime")
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("reaper", &self.reaper)
            .finish_non_exhaustive()
    }
}

impl TransportRuntime {
    /// Creates a runtime using the default socket factory.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if `config` fails validation.
    pub fn new(handle: Handle, config: TransportConfig) -> TransportResult<Self> {
        let factory = Arc::new(DefaultSocketFactory::new(config.prefer_nonblocking_io));
        Self::with_socket_factory(handle, config, factory)
    }

    /// Creates a runtime whose endpoints open sockets through `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if `config` fails validation.
    pub fn with_socket_factory(
        handle: Handle,
        config: TransportConfig,
        factory: Arc<dyn SocketFactory>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let reaper = Reaper::new(config.idle_timeout(), handle.clone());
        Ok(Self {
            handle,
            config,
            factory,
            reaper,
            registry: ListenRegistry::new(),
        })
    }

    /// Transport settings.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Runtime every transport task runs on.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Default socket factory.
    #[must_use]
    pub const fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.factory
    }

    /// Idle connection reaper.
    #[must_use]
    pub const fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Open listen operations.
    #[must_use]
    pub const fn registry(&self) -> &ListenRegistry {
        &self.registry
    }

    /// Mux settings derived from the configuration.
    #[must_use]
    pub fn mux_settings(&self) -> MuxSettings {
        MuxSettings {
            max_sessions: self.config.max_sessions_per_connection,
            handshake_timeout: self.config.handshake_timeout(),
            runtime: self.handle.clone(),
        }
    }

    /// Creates a connection manager for `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS client configuration cannot be built.
    pub fn connection_manager(
        &self,
        transport: &Transport,
        host: &str,
        port: u16,
    ) -> TransportResult<ConnectionManager> {
        let timeout = self.config.handshake_timeout();
        let endpoint: Arc<dyn ConnectionEndpoint> = match transport {
            Transport::Tcp => Arc::new(TcpEndpoint::new(
                host,
                port,
                Arc::clone(&self.factory),
                timeout,
            )),
            Transport::Tls(config) => Arc::new(TlsEndpoint::new(
                host,
                port,
                Arc::clone(&self.factory),
                timeout,
                Arc::clone(config),
            )?),
        };
        Ok(self.manager_for(endpoint))
    }

    /// Creates a connection manager over a custom endpoint.
    #[must_use]
    pub fn manager_for(&self, endpoint: Arc<dyn ConnectionEndpoint>) -> ConnectionManager {
        ConnectionManager::new(endpoint, self.mux_settings(), self.reaper.clone())
    }

    /// Listens on `host:port` and dispatches inbound requests.
    ///
    /// `constraints` must be satisfiable with the credentials `authorizer`
    /// permits. If an open listen already exists for the same host, port
    /// and socket factory, its handle is returned and it keeps its original
    /// dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedConstraints`] if the constraints
    /// cannot be met, or the error binding the socket.
    pub async fn listen(
        &self,
        transport: &Transport,
        host: &str,
        port: u16,
        constraints: &ConstraintSet,
        authorizer: &dyn ListenAuthorizer,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> TransportResult<ListenHandle> {
        let upgrader = transport.upgrader(authorizer, constraints)?;
        let key = ListenKey::new(host, port, &self.factory);
        self.registry
            .listen_or_reuse(key, || async move {
                let addr = resolve(host, port).await?;
                let listener = self.factory.bind(addr).await?;
                let manager = ServerSessionManager::new(upgrader, dispatcher, self.mux_settings());
                let operation = ListenOperation::new(manager, self.config.accept);
                let local = operation.listen(listener)?;
                info!(requested = %addr, bound = %local, transport = transport_name(transport), "listen started");
                Ok(ListenHandle::new(operation))
            })
            .await
    }

    /// Stops the reaper and closes every listen operation.
    pub async fn shutdown(&self) {
        self.reaper.shutdown();
        self.registry.close_all().await;
        info!("transport runtime shut down");
    }
}

const fn transport_name(transport: &Transport) -> &'static str {
    match transport {
        Transport::Tcp => "tcp",
        Transport::Tls(_) => "tls",
    }
}

async fn resolve(host: &str, port: u16) -> TransportResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ))
        })
}

#[cfg(test)]
mod tests {
    use tether_core::{AllowAll, Constraint, Toggle};

    use super::*;
    use crate::server::tests::Echo;

    fn runtime() -> TransportRuntime {
        TransportRuntime::new(Handle::current(), TransportConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = TransportConfig {
            max_sessions_per_connection: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(
            TransportRuntime::new(Handle::current(), config),
            Err(TransportError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_listen_rejects_confidentiality() {
        let runtime = runtime();
        let reqs = ConstraintSet::required([Constraint::Confidentiality(Toggle::Yes)]);
        let result = runtime
            .listen(&Transport::Tcp, "127.0.0.1", 0, &reqs, &AllowAll, Arc::new(Echo))
            .await;
        assert!(matches!(result, Err(TransportError::UnsupportedConstraints(_))));
        assert!(runtime.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_tcp_listen_and_shutdown() {
        let runtime = runtime();
        let handle = runtime
            .listen(
                &Transport::Tcp,
                "127.0.0.1",
                0,
                &ConstraintSet::empty(),
                &AllowAll,
                Arc::new(Echo),
            )
            .await
            .unwrap();
        assert_ne!(handle.local_addr().map(|a| a.port()), Some(0));

        runtime.shutdown().await;
        assert!(handle.is_closed());
        assert!(!runtime.reaper().is_running());
    }
}
