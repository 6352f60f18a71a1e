//! A keyed cache of live broker connections.
//!
//! The pool is an ordinary owned value: create one at start-up, hand clones
//! of the `Arc` to every producer and consumer, and call
//! [`ConnectionPool::shutdown`] on the way out.
//!
//! Reads go through a lock-free map and only return connections that still
//! report themselves open. Creating or replacing the connection for a key is
//! serialized behind a per-key gate, so concurrent callers never open two
//! connections for the same endpoint. Each connector receives a
//! [`CloseSignal`] that, when fired by the broker's shutdown callback, removes
//! exactly the connection it was issued for.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    resilience::ResiliencePolicy,
};

/// Normalized identity of a connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    /// Keys compare case-insensitively.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection descriptors the pool can key on.
pub trait Endpoint: Send + Sync {
    fn pool_key(&self) -> PoolKey;
}

pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Opens connections for one kind of endpoint.
pub trait Connector<P, C: ?Sized>: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a P, on_close: CloseSignal) -> BoxFuture<'a, Result<Arc<C>>>;
}

struct Entry<C: ?Sized> {
    generation: u64,
    connection: Arc<C>,
}

impl<C: ?Sized> Clone for Entry<C> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            connection: self.connection.clone(),
        }
    }
}

type Entries<C> = papaya::HashMap<PoolKey, Entry<C>>;

/// Handed to a connector; fire it when the broker reports the connection shut
/// down.
#[derive(Clone)]
pub struct CloseSignal {
    key: PoolKey,
    generation: u64,
    deregister: Arc<dyn Fn(&PoolKey, u64) + Send + Sync>,
}

impl CloseSignal {
    pub fn fire(&self) {
        (self.deregister)(&self.key, self.generation);
    }

    /// A signal that does nothing, for connections opened outside a pool.
    pub fn detached() -> Self {
        Self {
            key: PoolKey::new(""),
            generation: 0,
            deregister: Arc::new(|_, _| {}),
        }
    }
}

impl fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseSignal")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

pub struct ConnectionPool<P, C: ?Sized> {
    connector: Box<dyn Connector<P, C>>,
    entries: Arc<Entries<C>>,
    gates: Mutex<HashMap<PoolKey, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
    resilience: ResiliencePolicy,
    reconnect_jitter: Duration,
}

impl<P, C> ConnectionPool<P, C>
where
    P: Endpoint,
    C: Connection + ?Sized + 'static,
{
    pub fn new(
        connector: impl Connector<P, C> + 'static,
        resilience: ResiliencePolicy,
        reconnect_jitter: Duration,
    ) -> Self {
        Self {
            connector: Box::new(connector),
            entries: Arc::new(papaya::HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
            resilience,
            reconnect_jitter,
        }
    }

    pub fn resilience(&self) -> &ResiliencePolicy {
        &self.resilience
    }

    fn gate(&self, key: &PoolKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.entry(key.clone()).or_default().clone()
    }

    fn open_entry(&self, key: &PoolKey) -> Option<Arc<C>> {
        let entries = self.entries.pin();
        entries
            .get(key)
            .filter(|entry| entry.connection.is_open())
            .map(|entry| entry.connection.clone())
    }

    /// Number of connections currently cached, open or not.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, endpoint: &P) -> bool {
        self.open_entry(&endpoint.pool_key()).is_some()
    }

    fn close_signal(&self, key: &PoolKey, generation: u64) -> CloseSignal {
        let entries: Weak<Entries<C>> = Arc::downgrade(&self.entries);
        CloseSignal {
            key: key.clone(),
            generation,
            deregister: Arc::new(move |key, generation| {
                let Some(entries) = entries.upgrade() else {
                    return;
                };
                let entries = entries.pin();
                if entries.get(key).map(|entry| entry.generation) == Some(generation) {
                    tracing::info!(%key, "Broker closed connection, removing it from the pool");
                    entries.remove(key);
                }
            }),
        }
    }

    async fn connect(&self, endpoint: &P, key: &PoolKey) -> Result<Arc<C>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let connection = self
            .resilience
            .execute(key.as_str(), || {
                self.connector
                    .connect(endpoint, self.close_signal(key, generation))
            })
            .await?;

        tracing::info!(%key, generation, "Opened broker connection");
        self.entries.pin().insert(
            key.clone(),
            Entry {
                generation,
                connection: connection.clone(),
            },
        );
        Ok(connection)
    }

    /// Returns the open connection for `endpoint`, creating it if needed.
    pub async fn acquire(&self, endpoint: &P) -> Result<Arc<C>> {
        let key = endpoint.pool_key();
        if let Some(connection) = self.open_entry(&key) {
            return Ok(connection);
        }

        let gate = self.gate(&key);
        let _guard = gate.lock().await;

        if let Some(connection) = self.open_entry(&key) {
            return Ok(connection);
        }

        self.connect(endpoint, &key).await
    }

    pub async fn acquire_until(
        &self,
        endpoint: &P,
        cancel: &CancellationToken,
    ) -> Result<Arc<C>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(endpoint.pool_key().to_string())),
            connection = self.acquire(endpoint) => connection,
        }
    }

    /// Throws away whatever is cached for `endpoint` and connects again after
    /// a short random pause.
    pub async fn reset(&self, endpoint: &P) -> Result<Arc<C>> {
        let key = endpoint.pool_key();
        let gate = self.gate(&key);
        let _guard = gate.lock().await;

        self.discard(&key).await;

        let jitter_ms = u64::try_from(self.reconnect_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms > 0 {
            let pause = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
            tracing::debug!(%key, ?pause, "Waiting before reconnecting");
            tokio::time::sleep(pause).await;
        }

        self.connect(endpoint, &key).await
    }

    pub async fn reset_until(&self, endpoint: &P, cancel: &CancellationToken) -> Result<Arc<C>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(endpoint.pool_key().to_string())),
            connection = self.reset(endpoint) => connection,
        }
    }

    /// Drops the gate for `key` unless a caller still holds it.
    fn prune_gate(&self, key: &PoolKey) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if gates.get(key).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(key);
        }
    }

    /// Closes and forgets the connection for `endpoint`, if any.
    pub async fn release(&self, endpoint: &P) {
        let key = endpoint.pool_key();
        {
            let gate = self.gate(&key);
            let _guard = gate.lock().await;
            self.discard(&key).await;
        }
        self.prune_gate(&key);
    }

    async fn discard(&self, key: &PoolKey) {
        let removed = self.entries.pin().remove(key).cloned();
        if let Some(entry) = removed {
            if let Err(e) = entry.connection.close().await {
                tracing::warn!(%key, "Error closing connection: {e}");
            }
        }
    }

    /// Closes every pooled connection.
    pub async fn shutdown(&self) {
        let keys: Vec<PoolKey> = self.entries.pin().keys().cloned().collect();
        for key in keys {
            {
                let gate = self.gate(&key);
                let _guard = gate.lock().await;
                self.discard(&key).await;
            }
            self.prune_gate(&key);
        }
        tracing::info!("Connection pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::resilience::{CircuitBreaker, RetryPolicy};

    struct FakeEndpoint(&'static str);

    impl Endpoint for FakeEndpoint {
        fn pool_key(&self) -> PoolKey {
            PoolKey::new(self.0)
        }
    }

    struct FakeConnection {
        open: AtomicBool,
        on_close: CloseSignal,
    }

    impl Connection for FakeConnection {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            self.open.store(false, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        connects: Arc<AtomicUsize>,
        failures_left: Arc<AtomicUsize>,
    }

    impl Connector<FakeEndpoint, FakeConnection> for FakeConnector {
        fn connect<'a>(
            &'a self,
            endpoint: &'a FakeEndpoint,
            on_close: CloseSignal,
        ) -> BoxFuture<'a, Result<Arc<FakeConnection>>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(Error::unreachable(endpoint.0, "connection refused"));
                }
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(FakeConnection {
                    open: AtomicBool::new(true),
                    on_close,
                }))
            })
        }
    }

    fn pool(connector: FakeConnector) -> Arc<ConnectionPool<FakeEndpoint, FakeConnection>> {
        Arc::new(ConnectionPool::new(
            connector,
            ResiliencePolicy::new(
                RetryPolicy::new(3, Duration::from_millis(10)),
                CircuitBreaker::new(5, Duration::from_secs(10)),
            ),
            Duration::from_millis(20),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_connects_once() {
        let connector = FakeConnector::default();
        let pool = pool(connector.clone());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(&FakeEndpoint("amqp://Host/vhost")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_case_insensitive() {
        let connector = FakeConnector::default();
        let pool = pool(connector.clone());

        let a = pool.acquire(&FakeEndpoint("AMQP://HOST/v")).await.unwrap();
        let b = pool.acquire(&FakeEndpoint("amqp://host/v")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_close_deregisters() {
        let connector = FakeConnector::default();
        let pool = pool(connector.clone());
        let endpoint = FakeEndpoint("amqp://host/v");

        let first = pool.acquire(&endpoint).await.unwrap();
        first.open.store(false, Ordering::SeqCst);
        first.on_close.fire();
        assert!(pool.is_empty());

        let second = pool.acquire(&endpoint).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        // A stale signal must not evict the replacement.
        first.on_close.fire();
        assert!(pool.contains(&endpoint));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_entry_is_never_served() {
        let connector = FakeConnector::default();
        let pool = pool(connector.clone());
        let endpoint = FakeEndpoint("amqp://host/v");

        let first = pool.acquire(&endpoint).await.unwrap();
        first.open.store(false, Ordering::SeqCst);

        let second = pool.acquire(&endpoint).await.unwrap();
        assert!(second.is_open());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_replaces_connection() {
        let connector = FakeConnector::default();
        let pool = pool(connector.clone());
        let endpoint = FakeEndpoint("amqp://host/v");

        let first = pool.acquire(&endpoint).await.unwrap();
        let second = pool.reset(&endpoint).await.unwrap();

        assert!(!first.is_open());
        assert!(second.is_open());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_retried() {
        let connector = FakeConnector::default();
        connector.failures_left.store(2, Ordering::SeqCst);
        let pool = pool(connector.clone());

        pool.acquire(&FakeEndpoint("amqp://host/v")).await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.resilience().retries_for("amqp://host/v"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_releases_gate() {
        let connector = FakeConnector::default();
        connector.failures_left.store(2, Ordering::SeqCst);
        let pool = pool(connector.clone());
        let endpoint = FakeEndpoint("amqp://host/v");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pool.acquire_until(&endpoint, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled { .. })));

        pool.acquire(&endpoint).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_and_shutdown_close() {
        let pool = pool(FakeConnector::default());
        let a = pool.acquire(&FakeEndpoint("amqp://a/v")).await.unwrap();
        let b = pool.acquire(&FakeEndpoint("amqp://b/v")).await.unwrap();

        pool.release(&FakeEndpoint("amqp://a/v")).await;
        assert!(!a.is_open());
        assert_eq!(pool.len(), 1);

        pool.shutdown().await;
        assert!(!b.is_open());
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_forgets_gate() {
        let pool = pool(FakeConnector::default());
        let gates = |pool: &ConnectionPool<FakeEndpoint, FakeConnection>| {
            pool.gates.lock().unwrap().len()
        };

        pool.acquire(&FakeEndpoint("amqp://a/v")).await.unwrap();
        pool.acquire(&FakeEndpoint("amqp://b/v")).await.unwrap();
        assert_eq!(gates(pool.as_ref()), 2);

        pool.release(&FakeEndpoint("amqp://a/v")).await;
        assert_eq!(gates(pool.as_ref()), 1);

        pool.shutdown().await;
        assert_eq!(gates(pool.as_ref()), 0);
    }
}
