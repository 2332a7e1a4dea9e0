//! TLS transport, end to end, with certificates from an in-memory CA.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{roundtrip, runtime, Echo, TestCa};
use tether_core::{
    AllowAll, Constraint, ConstraintSet, PeerIdentity, Principal, RequestHandle, Toggle,
};
use tether_net::{ContextEntry, TlsConfig, Transport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

fn tls(config: TlsConfig) -> Transport {
    Transport::Tls(Arc::new(config))
}

#[tokio::test]
async fn test_mutual_tls_roundtrip() {
    let runtime = runtime();
    let ca = TestCa::new("Tether Test CA");
    let (server_cert, server_key) = ca.issue("server-a");
    let (client_cert, client_key) = ca.issue("client-a");

    let server = tls(TlsConfig::builder()
        .identity_pem(server_cert, server_key)
        .trust_roots_pem(ca.cert_pem())
        .require_client_auth(true)
        .build()
        .unwrap());
    let client = tls(TlsConfig::builder()
        .identity_pem(client_cert, client_key)
        .trust_roots_pem(ca.cert_pem())
        .server_name("server-a")
        .build()
        .unwrap());

    let (echo, mut contexts) = Echo::new();
    let listen_constraints = ConstraintSet::required([
        Constraint::ServerAuthentication(Toggle::Yes),
        Constraint::ClientAuthentication(Toggle::Yes),
    ]);
    let listen = runtime
        .listen(&server, "127.0.0.1", 0, &listen_constraints, &AllowAll, echo)
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();

    let manager = runtime.connection_manager(&client, "127.0.0.1", port).unwrap();
    let handle = RequestHandle::new(ConstraintSet::required([
        Constraint::Confidentiality(Toggle::Yes),
        Constraint::server_min(["server-a"]),
    ]));
    let mut request = manager.new_request(handle).next().await.unwrap();
    assert!(request.unfulfilled_constraints().is_empty());
    let security = request.connection().security();
    assert_eq!(
        security.server().map(|s| s.principal.name()),
        Some("server-a")
    );
    assert_eq!(
        security.client(),
        &PeerIdentity::Known(Principal::new("client-a"))
    );

    request.request_writer().write_all(b"secret").await.unwrap();
    request.request_writer().shutdown().await.unwrap();
    let mut body = Vec::new();
    request
        .response()
        .await
        .unwrap()
        .read_to_end(&mut body)
        .await
        .unwrap();
    assert_eq!(body, b"secret");

    let context = contexts.recv().await.unwrap();
    assert!(context.contains(&ContextEntry::ClientPrincipal(Principal::new("client-a"))));
    assert!(context.contains(&ContextEntry::Integrity(true)));
    assert!(context
        .iter()
        .any(|entry| matches!(entry, ContextEntry::CipherSuite(name) if name.starts_with("TLS13_"))));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_client_identity_unsent_when_server_does_not_ask() {
    let runtime = runtime();
    let ca = TestCa::new("Tether Test CA");
    let (server_cert, server_key) = ca.issue("server-a");
    let (client_cert, client_key) = ca.issue("client-a");

    let server = tls(TlsConfig::builder()
        .identity_pem(server_cert, server_key)
        .build()
        .unwrap());
    let client = tls(TlsConfig::builder()
        .identity_pem(client_cert, client_key)
        .trust_roots_pem(ca.cert_pem())
        .server_name("server-a")
        .build()
        .unwrap());

    let (echo, mut contexts) = Echo::new();
    let listen = runtime
        .listen(&server, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo.clone())
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();
    let manager = runtime.connection_manager(&client, "127.0.0.1", port).unwrap();

    let needs_client = RequestHandle::new(ConstraintSet::required([
        Constraint::ClientAuthentication(Toggle::Yes),
        Constraint::client_min(["client-a"]),
    ]));
    let result = timeout(Duration::from_secs(10), manager.new_request(needs_client).next())
        .await
        .unwrap();
    assert!(matches!(result, Err(TransportError::UnsupportedConstraints(_))));
    assert_eq!(echo.dispatched(), 0);

    let mut request = manager
        .new_request(RequestHandle::unconstrained())
        .next()
        .await
        .unwrap();
    assert_eq!(request.connection().security().client(), &PeerIdentity::Anonymous);
    request.request_writer().write_all(b"plain").await.unwrap();
    request.request_writer().shutdown().await.unwrap();
    let mut body = Vec::new();
    request
        .response()
        .await
        .unwrap()
        .read_to_end(&mut body)
        .await
        .unwrap();
    assert_eq!(body, b"plain");

    let context = contexts.recv().await.unwrap();
    assert!(!context
        .iter()
        .any(|entry| matches!(entry, ContextEntry::ClientPrincipal(_) | ContextEntry::AuthenticatedClient)));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_anonymous_tls() {
    let runtime = runtime();
    let transport = tls(TlsConfig::builder().build().unwrap());
    let (echo, mut contexts) = Echo::new();
    let listen = runtime
        .listen(&transport, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo)
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();

    let manager = runtime.connection_manager(&transport, "localhost", port).unwrap();
    assert_eq!(roundtrip(&manager, b"anon").await, b"anon");

    let context = contexts.recv().await.unwrap();
    assert!(!context
        .iter()
        .any(|entry| matches!(entry, ContextEntry::ClientPrincipal(_) | ContextEntry::AuthenticatedClient)));

    let needs_server = RequestHandle::new(ConstraintSet::required([
        Constraint::ServerAuthentication(Toggle::Yes),
    ]));
    let result = manager.new_request(needs_server).next().await;
    assert!(matches!(result, Err(TransportError::UnsupportedConstraints(_))));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_listen_constraints_need_usable_identity() {
    let runtime = runtime();
    let ca = TestCa::new("Tether Test CA");
    let (cert, key) = ca.issue("server-a");
    let transport = tls(TlsConfig::builder()
        .identity_pem(cert, key)
        .trust_roots_pem(ca.cert_pem())
        .build()
        .unwrap());
    let (echo, _contexts) = Echo::new();
    let reqs = ConstraintSet::required([Constraint::server_min(["server-b"])]);

    let result = runtime
        .listen(&transport, "127.0.0.1", 0, &reqs, &AllowAll, echo)
        .await;
    assert!(matches!(result, Err(TransportError::UnsupportedConstraints(_))));
}

#[tokio::test]
async fn test_untrusted_client_is_refused() {
    let runtime = runtime();
    let ca = TestCa::new("Tether Test CA");
    let rogue = TestCa::new("Rogue CA");
    let (server_cert, server_key) = ca.issue("server-a");
    let (client_cert, client_key) = rogue.issue("client-a");

    let server = tls(TlsConfig::builder()
        .identity_pem(server_cert, server_key)
        .trust_roots_pem(ca.cert_pem())
        .require_client_auth(true)
        .build()
        .unwrap());
    let client = tls(TlsConfig::builder()
        .identity_pem(client_cert, client_key)
        .trust_roots_pem(ca.cert_pem())
        .server_name("server-a")
        .build()
        .unwrap());

    let (echo, _contexts) = Echo::new();
    let listen = runtime
        .listen(&server, "127.0.0.1", 0, &ConstraintSet::empty(), &AllowAll, echo.clone())
        .await
        .unwrap();
    let port = listen.local_addr().unwrap().port();

    let manager = runtime.connection_manager(&client, "127.0.0.1", port).unwrap();
    let result = timeout(
        Duration::from_secs(10),
        manager.new_request(RequestHandle::unconstrained()).next(),
    )
    .await
    .unwrap();
    assert!(result.is_err());
    assert_eq!(echo.dispatched(), 0);

    runtime.shutdown().await;
}
