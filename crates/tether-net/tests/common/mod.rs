//! Shared helpers for tether-net integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, SanType};
use tether_core::{RequestHandle, TransportConfig};
use tether_net::server::{Dispatcher, InboundRequest};
use tether_net::{ConnectionManager, ContextEntry, TransportRuntime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

static INIT: Once = Once::new();

/// Installs the ring provider and a test subscriber once per binary.
pub fn init() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Runtime on the current tokio runtime with default settings.
pub fn runtime() -> TransportRuntime {
    runtime_with(TransportConfig::default())
}

/// Runtime on the current tokio runtime.
pub fn runtime_with(config: TransportConfig) -> TransportRuntime {
    init();
    TransportRuntime::new(Handle::current(), config).expect("valid config")
}

/// Echoes the request body and reports each request's context.
pub struct Echo {
    dispatched: AtomicUsize,
    contexts: mpsc::UnboundedSender<Vec<ContextEntry>>,
}

impl Echo {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<ContextEntry>>) {
        let (contexts, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                dispatched: AtomicUsize::new(0),
                contexts,
            }),
            rx,
        )
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for Echo {
    async fn dispatch(&self, mut request: InboundRequest) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let mut context = Vec::new();
        request.populate_context(&mut context);
        let _ = self.contexts.send(context);

        let mut body = Vec::new();
        if request.request_reader().read_to_end(&mut body).await.is_ok() {
            let _ = request.response_writer().write_all(&body).await;
            let _ = request.response_writer().shutdown().await;
        }
    }
}

/// Sends `body` as one request and returns the response body.
pub async fn roundtrip(manager: &ConnectionManager, body: &[u8]) -> Vec<u8> {
    let mut attempts = manager.new_request(RequestHandle::unconstrained());
    let mut request = attempts.next().await.expect("request started");
    request.request_writer().write_all(body).await.unwrap();
    request.request_writer().shutdown().await.unwrap();
    let mut response = Vec::new();
    request
        .response()
        .await
        .unwrap()
        .read_to_end(&mut response)
        .await
        .unwrap();
    response
}

/// In-memory certificate authority.
pub struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().expect("key generation should succeed");
        let cert = params
            .self_signed(&key)
            .expect("self-signing should succeed");
        Self { cert, key }
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Certificate and key PEM for `name`, used as common name and DNS name.
    pub fn issue(&self, name: &str) -> (String, String) {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.subject_alt_names = vec![SanType::DnsName(
            name.try_into().expect("valid DNS name"),
        )];
        let key = KeyPair::generate().expect("key generation should succeed");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("signing should succeed");
        (cert.pem(), key.serialize_pem())
    }
}
