#![allow(clippy::doc_markdown)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! # tether-net
//!
//! Connections, multiplexing and listening for the tether RPC transport.
//!
//! - [`mux`]: many logical sessions over one byte stream
//! - [`client`]: pooled connections per endpoint, reaped when idle
//! - [`server`]: listen operations, accept throttling and session dispatch
//! - [`tcp`] and [`tls`]: the two stream layers, selected by [`Transport`]
//! - [`TransportRuntime`]: the runtime handle, reaper and listen registry
//!   every endpoint shares
//!
//! Security requirements are expressed with `tether_core` constraints.
//! Listening checks them against the available credentials; each request
//! checks them against the connection it lands on and carries the residual
//! constraints up to the RPC layer.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tether_core::{AllowAll, ConstraintSet, RequestHandle, TransportConfig};
//! use tether_net::server::{Dispatcher, InboundRequest};
//! use tether_net::{Transport, TransportRuntime};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Dispatcher for Echo {
//!     async fn dispatch(&self, mut request: InboundRequest) {
//!         let mut body = Vec::new();
//!         if request.request_reader().read_to_end(&mut body).await.is_ok() {
//!             let _ = request.response_writer().write_all(&body).await;
//!             let _ = request.response_writer().shutdown().await;
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = TransportRuntime::new(tokio::runtime::Handle::current(), TransportConfig::default())?;
//! let listen = runtime
//!     .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, Arc::new(Echo))
//!     .await?;
//! let port = listen.local_addr().map_or(0, |addr| addr.port());
//!
//! let manager = runtime.connection_manager(&Transport::Tcp, "127.0.0.1", port)?;
//! let mut attempts = manager.new_request(RequestHandle::unconstrained());
//! let mut request = attempts.next().await?;
//! request.request_writer().write_all(b"ping").await?;
//! request.request_writer().shutdown().await?;
//! let mut reply = Vec::new();
//! request.response().await?.read_to_end(&mut reply).await?;
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod context;
pub mod error;
pub mod mux;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod socket_factory;
pub mod tcp;
pub mod tls;

pub use client::{ConnectionEndpoint, ConnectionManager, OutboundRequest, Reaper};
pub use connection::{BoxedStream, StreamConnection};
pub use context::{ContextEntry, SecurityContext};
pub use error::{TransportError, TransportResult};
pub use runtime::{Transport, TransportRuntime};
pub use server::{Dispatcher, InboundRequest, ListenHandle};
pub use socket_factory::{DefaultSocketFactory, SocketFactory};
pub use tls::{TlsConfig, TlsConfigBuilder};
