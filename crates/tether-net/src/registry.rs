//! Deduplication of listen operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TransportResult;
use crate::server::ListenHandle;
use crate::socket_factory::{factory_id, SocketFactory};

/// What makes two listen requests the same: requested host and port and
/// the socket factory instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenKey {
    host: String,
    port: u16,
    factory: usize,
}

impl ListenKey {
    /// Creates a key.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, factory: &Arc<dyn SocketFactory>) -> Self {
        Self {
            host: host.into(),
            port,
            factory: factory_id(factory),
        }
    }

    /// Requested host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Requested port; `0` for any.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

/// Open listen operations by key.
///
/// A listen request for a key with an open operation returns that
/// operation's handle instead of binding again. Closed or failed
/// operations are replaced.
#[derive(Debug, Default)]
pub struct ListenRegistry {
    entries: Mutex<HashMap<ListenKey, ListenHandle>>,
}

impl ListenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open handle for `key`, or runs `start` and records the
    /// handle it produces.
    ///
    /// Concurrent calls for any key are serialized, so `start` runs at most
    /// once per open operation.
    ///
    /// # Errors
    ///
    /// Returns the error from `start`; nothing is recorded then.
    pub async fn listen_or_reuse<F, Fut>(&self, key: ListenKey, start: F) -> TransportResult<ListenHandle>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = TransportResult<ListenHandle>> + Send,
    {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&key) {
            if is_open(existing) {
                debug!(host = key.host(), port = key.port(), "reusing listen operation");
                return Ok(existing.clone());
            }
            entries.remove(&key);
        }
        let handle = start().await?;
        entries.insert(key, handle.clone());
        Ok(handle)
    }

    /// Open operations.
    pub async fn len(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|handle| is_open(handle))
            .count()
    }

    /// Returns `true` when no operation is open.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes and forgets every operation.
    pub async fn close_all(&self) {
        let handles: Vec<ListenHandle> = self.entries.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
    }
}

fn is_open(handle: &ListenHandle) -> bool {
    !handle.is_closed() && handle.operation().failure().is_none()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tether_core::AcceptConfig;
    use tokio::net::TcpListener;

    use super::*;
    use crate::server::tests::echo_manager;
    use crate::server::ListenOperation;
    use crate::socket_factory::DefaultSocketFactory;

    async fn start(counter: &AtomicUsize) -> TransportResult<ListenHandle> {
        counter.fetch_add(1, Ordering::SeqCst);
        let operation = ListenOperation::new(echo_manager(), AcceptConfig::default());
        operation.listen(TcpListener::bind("127.0.0.1:0").await?)?;
        Ok(ListenHandle::new(operation))
    }

    #[tokio::test]
    async fn test_same_key_shares_operation() {
        let registry = ListenRegistry::new();
        let factory: Arc<dyn SocketFactory> = Arc::new(DefaultSocketFactory::default());
        let starts = AtomicUsize::new(0);

        let first = registry
            .listen_or_reuse(ListenKey::new("127.0.0.1", 0, &factory), || start(&starts))
            .await
            .unwrap();
        let second = registry
            .listen_or_reuse(ListenKey::new("127.0.0.1", 0, &factory), || start(&starts))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let other_factory: Arc<dyn SocketFactory> = Arc::new(DefaultSocketFactory::default());
        let third = registry
            .listen_or_reuse(ListenKey::new("127.0.0.1", 0, &other_factory), || start(&starts))
            .await
            .unwrap();
        assert_ne!(first, third);
        assert_eq!(registry.len().await, 2);

        registry.close_all().await;
        assert!(first.is_closed() && third.is_closed());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_closed_operation_is_replaced() {
        let registry = ListenRegistry::new();
        let factory: Arc<dyn SocketFactory> = Arc::new(DefaultSocketFactory::default());
        let starts = AtomicUsize::new(0);
        let key = ListenKey::new("127.0.0.1", 0, &factory);

        let first = registry
            .listen_or_reuse(key.clone(), || start(&starts))
            .await
            .unwrap();
        assert!(first.close().await);

        let second = registry.listen_or_reuse(key, || start(&starts)).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        second.close().await;
    }
}
