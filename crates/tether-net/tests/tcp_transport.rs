//! Plain TCP transport, end to end.
//!
//! Listens through a [`TransportRuntime`] on an ephemeral port and drives
//! requests through a pooled [`ConnectionManager`].

mod common;

use std::time::Duration;

use common::{roundtrip, runtime, runtime_with, Echo};
use tether_core::{AllowAll, Constraint, ConstraintSet, RequestHandle, Toggle, TransportConfig};
use tether_net::{ContextEntry, Transport, TransportError};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

#[tokio::test]
async fn test_listen_on_port_zero_dispatches() {
    let runtime = runtime();
    let (echo, mut contexts) = Echo::new();
    let listen = runtime
        .listen(
            &Transport::Tcp,
            "127.0.0.1",
            0,
            &ConstraintSet::empty(),
            &AllowAll,
            echo.clone(),
        )
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();
    assert_ne!(port, 0);

    let manager = runtime
        .connection_manager(&Transport::Tcp, "127.0.0.1", port)
        .unwrap();
    assert_eq!(roundtrip(&manager, b"hello").await, b"hello");
    assert_eq!(echo.dispatched(), 1);

    let context = contexts.recv().await.unwrap();
    assert!(context.contains(&ContextEntry::CipherSuite("PLAINTEXT")));
    assert!(context.contains(&ContextEntry::Integrity(false)));
    assert!(context
        .iter()
        .any(|entry| matches!(entry, ContextEntry::ClientHost(ip) if ip.is_loopback())));

    manager.shutdown();
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_sequential_requests_reuse_connection() {
    let runtime = runtime();
    let (echo, _contexts) = Echo::new();
    let listen = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo.clone())
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();
    let manager = runtime
        .connection_manager(&Transport::Tcp, "127.0.0.1", port)
        .unwrap();

    for i in 0..5u8 {
        assert_eq!(roundtrip(&manager, &[i; 16]).await, [i; 16]);
    }
    assert_eq!(manager.connection_count(), 1);
    assert_eq!(echo.dispatched(), 5);
    assert_eq!(listen.operation().live_connections().len(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_session_limit_opens_second_connection() {
    let runtime = runtime_with(TransportConfig {
        max_sessions_per_connection: 2,
        ..TransportConfig::default()
    });
    let (echo, _contexts) = Echo::new();
    let listen = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo)
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();
    let manager = runtime
        .connection_manager(&Transport::Tcp, "127.0.0.1", port)
        .unwrap();

    let mut open = Vec::new();
    for _ in 0..3 {
        let mut request = manager
            .new_request(RequestHandle::unconstrained())
            .next()
            .await
            .unwrap();
        request.request_writer().write_all(b"held").await.unwrap();
        open.push(request);
    }
    assert_eq!(manager.connection_count(), 2);
    let first = open[0].connection().id();
    assert_eq!(open[1].connection().id(), first);
    assert_ne!(open[2].connection().id(), first);

    drop(open);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_finished_session_frees_slot_on_shared_connection() {
    let runtime = runtime_with(TransportConfig {
        max_sessions_per_connection: 2,
        ..TransportConfig::default()
    });
    let (echo, _contexts) = Echo::new();
    let listen = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo)
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();
    let manager = runtime
        .connection_manager(&Transport::Tcp, "127.0.0.1", port)
        .unwrap();

    let mut held = manager
        .new_request(RequestHandle::unconstrained())
        .next()
        .await
        .unwrap();
    held.request_writer().write_all(b"held").await.unwrap();
    assert_eq!(roundtrip(&manager, b"second").await, b"second");

    let mut third = manager
        .new_request(RequestHandle::unconstrained())
        .next()
        .await
        .unwrap();
    third.request_writer().write_all(b"third").await.unwrap();
    assert_eq!(third.connection().id(), held.connection().id());
    assert_eq!(manager.connection_count(), 1);

    drop((held, third));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_reaper_closes_idle_connection_and_next_request_reconnects() {
    let runtime = runtime_with(TransportConfig {
        idle_timeout_ms: 200,
        ..TransportConfig::default()
    });
    let (echo, _contexts) = Echo::new();
    let listen = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo.clone())
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();
    let manager = runtime
        .connection_manager(&Transport::Tcp, "127.0.0.1", port)
        .unwrap();

    let mut request = manager
        .new_request(RequestHandle::unconstrained())
        .next()
        .await
        .unwrap();
    let first = std::sync::Arc::clone(request.connection());
    request.request_writer().shutdown().await.unwrap();
    drop(request);
    assert!(!first.is_closed());

    timeout(Duration::from_secs(5), async {
        while !first.is_closed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(manager.connection_count(), 0);

    let mut request = manager
        .new_request(RequestHandle::unconstrained())
        .next()
        .await
        .unwrap();
    assert_ne!(request.connection().id(), first.id());
    request.request_writer().shutdown().await.unwrap();
    drop(request);
    assert_eq!(roundtrip(&manager, b"again").await, b"again");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_constraints_fail_before_connecting() {
    let runtime = runtime();
    let manager = runtime
        .connection_manager(&Transport::Tcp, "127.0.0.1", 9)
        .unwrap();
    let handle = RequestHandle::new(ConstraintSet::required([Constraint::Confidentiality(
        Toggle::Yes,
    )]));
    let result = manager.new_request(handle).next().await;
    assert!(matches!(result, Err(TransportError::UnsupportedConstraints(_))));
    assert_eq!(manager.connection_count(), 0);
}

#[tokio::test]
async fn test_same_endpoint_shares_listen() {
    let runtime = runtime();
    let (echo, _contexts) = Echo::new();
    let first = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo.clone())
        .await
        .unwrap();
    let second = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.local_addr(), second.local_addr());
    assert_eq!(runtime.registry().len().await, 1);

    runtime.shutdown().await;
    assert!(first.is_closed());
}

#[tokio::test]
async fn test_close_with_idle_accept_returns_promptly() {
    let runtime = runtime();
    let (echo, _contexts) = Echo::new();
    let listen = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo)
        .await
        .unwrap();

    let closed = timeout(Duration::from_secs(5), listen.close()).await.unwrap();
    assert!(closed);
    assert!(!listen.close().await);
    timeout(Duration::from_secs(5), listen.operation().accept_stopped())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_shuts_down_live_connections() {
    let runtime = runtime();
    let (echo, _contexts) = Echo::new();
    let listen = runtime
        .listen(&Transport::Tcp, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo)
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();
    let manager = runtime
        .connection_manager(&Transport::Tcp, "127.0.0.1", port)
        .unwrap();
    assert_eq!(roundtrip(&manager, b"warm").await, b"warm");
    let live = listen.operation().live_connections();
    assert_eq!(live.len(), 1);

    assert!(listen.close().await);
    assert!(listen.operation().live_connections().is_empty());
    assert!(live.iter().all(|connection| connection.is_closed()));

    runtime.shutdown().await;
}
