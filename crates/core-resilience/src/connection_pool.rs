//! Per-provider connection pool
//!
//! Each provider gets its own bounded set of connections. Acquiring prefers an
//! idle connection, then creates a new one while the provider is below
//! `max_size`, and otherwise parks the caller in a bounded FIFO queue. A
//! released connection is handed straight to the oldest live waiter; with no
//! one waiting it is kept idle up to `min_size` and destroyed beyond that.
//!
//! Connections are opaque to the pool. The pool only needs to clone them (so a
//! copy can be destroyed on [`ConnectionPool::clear`]) and to ask them to
//! disconnect.

use crate::error::ResilienceError;
use crate::metrics::MetricsTracker;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for connection pool behavior
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of connections per provider (idle, in use and being created)
    pub max_size: usize,
    /// Idle connections kept on release; anything beyond is destroyed
    pub min_size: usize,
    /// Timeout for a queued acquire
    pub acquire_timeout: Duration,
    /// Idle connections older than this are evicted by the reaper
    pub idle_timeout: Option<Duration>,
    /// Maximum number of callers queued per provider
    pub max_waiting_clients: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            min_size: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(60)),
            max_waiting_clients: 10,
        }
    }
}

/// A connection that can live in the pool
#[async_trait::async_trait]
pub trait Poolable: Clone + Send + Sync + 'static {
    /// Close the underlying connection
    async fn disconnect(&self) -> Result<(), ResilienceError>;
}

/// Creates connections for a provider
#[async_trait::async_trait]
pub trait ConnectionFactory<C>: Send + Sync {
    async fn create(&self, provider_id: &str) -> Result<C, ResilienceError>;
}

/// A connection checked out of the pool
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it without
/// releasing keeps its slot occupied until the provider is cleared.
#[derive(Debug, Clone)]
pub struct PooledConnection<C> {
    id: u64,
    provider_id: String,
    conn: C,
}

impl<C> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

/// Pool statistics for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub creating: usize,
    pub waiting: usize,
    pub max_size: usize,
}

impl PoolStats {
    /// Connections counted against `max_size`
    pub fn total(&self) -> usize {
        self.available + self.in_use + self.creating
    }

    /// Percentage of the pool capacity that is busy
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            ((self.in_use + self.creating) as f64 / self.max_size as f64) * 100.0
        }
    }
}

/// Holds one unit of creation capacity; released on drop
struct CreateSlot {
    creating: Arc<AtomicUsize>,
}

impl CreateSlot {
    fn reserve(creating: &Arc<AtomicUsize>) -> Self {
        creating.fetch_add(1, Ordering::SeqCst);
        Self {
            creating: Arc::clone(creating),
        }
    }
}

impl Drop for CreateSlot {
    fn drop(&mut self) {
        self.creating.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a queued caller is woken with
enum Grant<C> {
    /// An existing connection, already recorded as in use
    Connection(u64, C),
    /// Capacity freed by a failed create; the waiter creates its own
    Slot(CreateSlot),
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Result<Grant<C>, ResilienceError>>,
}

struct IdleConnection<C> {
    id: u64,
    conn: C,
    idle_since: Instant,
}

struct ProviderPool<C> {
    config: PoolConfig,
    /// Distinguishes this pool from one recreated after `clear`
    generation: u64,
    /// Most recently released last
    available: Vec<IdleConnection<C>>,
    in_use: HashMap<u64, C>,
    creating: Arc<AtomicUsize>,
    waiting: VecDeque<Waiter<C>>,
}

impl<C: Poolable> ProviderPool<C> {
    fn new(config: PoolConfig, generation: u64) -> Self {
        Self {
            config,
            generation,
            available: Vec::new(),
            in_use: HashMap::new(),
            creating: Arc::new(AtomicUsize::new(0)),
            waiting: VecDeque::new(),
        }
    }

    fn busy(&self) -> usize {
        self.in_use.len() + self.creating.load(Ordering::SeqCst)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.available.len(),
            in_use: self.in_use.len(),
            creating: self.creating.load(Ordering::SeqCst),
            waiting: self.waiting.len(),
            max_size: self.config.max_size,
        }
    }

    /// Give a freed creation slot to the oldest live waiter
    fn hand_off_slot(&mut self, mut slot: CreateSlot) {
        while let Some(waiter) = self.waiting.pop_front() {
            match waiter.tx.send(Ok(Grant::Slot(slot))) {
                Ok(()) => return,
                Err(Ok(Grant::Slot(returned))) => slot = returned,
                Err(_) => return,
            }
        }
    }

    /// Give a connection to the oldest live waiter, or return it
    fn hand_off_connection(&mut self, id: u64, mut conn: C) -> Option<C> {
        while let Some(waiter) = self.waiting.pop_front() {
            self.in_use.insert(id, conn.clone());
            match waiter.tx.send(Ok(Grant::Connection(id, conn))) {
                Ok(()) => return None,
                Err(Ok(Grant::Connection(_, returned))) => {
                    self.in_use.remove(&id);
                    conn = returned;
                }
                Err(_) => {
                    self.in_use.remove(&id);
                    return None;
                }
            }
        }
        Some(conn)
    }

    /// Tear the pool down: fail every waiter and return every connection
    fn drain(self, provider_id: &str) -> Vec<C> {
        for waiter in self.waiting {
            let _ = waiter
                .tx
                .send(Err(ResilienceError::PoolCleared(provider_id.to_string())));
        }
        self.available
            .into_iter()
            .map(|idle| idle.conn)
            .chain(self.in_use.into_values())
            .collect()
    }
}

struct PoolInner<C> {
    default_config: PoolConfig,
    overrides: Mutex<HashMap<String, PoolConfig>>,
    factory: Arc<dyn ConnectionFactory<C>>,
    metrics: Option<Arc<MetricsTracker>>,
    providers: Mutex<HashMap<String, ProviderPool<C>>>,
    next_id: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Connection pool keyed by provider id
///
/// # Example
/// ```no_run
/// use tether_core_resilience::connection_pool::{
///     ConnectionFactory, ConnectionPool, PoolConfig, Poolable,
/// };
/// use tether_core_resilience::ResilienceError;
/// use std::sync::Arc;
///
/// #[derive(Clone)]
/// struct Session;
///
/// #[async_trait::async_trait]
/// impl Poolable for Session {
///     async fn disconnect(&self) -> Result<(), ResilienceError> {
///         Ok(())
///     }
/// }
///
/// struct SessionFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<Session> for SessionFactory {
///     async fn create(&self, _provider_id: &str) -> Result<Session, ResilienceError> {
///         Ok(Session)
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(Arc::new(SessionFactory), PoolConfig::default());
/// let conn = pool.acquire("ollama").await?;
/// // Use connection...
/// pool.release("ollama", conn).await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Poolable> ConnectionPool<C> {
    pub fn new(factory: Arc<dyn ConnectionFactory<C>>, default_config: PoolConfig) -> Self {
        Self::build(factory, default_config, None)
    }

    /// Record connection creation outcomes in `metrics`
    pub fn with_metrics(
        factory: Arc<dyn ConnectionFactory<C>>,
        default_config: PoolConfig,
        metrics: Arc<MetricsTracker>,
    ) -> Self {
        Self::build(factory, default_config, Some(metrics))
    }

    fn build(
        factory: Arc<dyn ConnectionFactory<C>>,
        default_config: PoolConfig,
        metrics: Option<Arc<MetricsTracker>>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                default_config,
                overrides: Mutex::new(HashMap::new()),
                factory,
                metrics,
                providers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Use `config` for `provider_id`; takes effect the next time its pool is created
    pub async fn set_config(&self, provider_id: &str, config: PoolConfig) {
        self.inner
            .overrides
            .lock()
            .await
            .insert(provider_id.to_string(), config);
    }

    pub async fn config_for(&self, provider_id: &str) -> PoolConfig {
        self.inner
            .overrides
            .lock()
            .await
            .get(provider_id)
            .cloned()
            .unwrap_or_else(|| self.inner.default_config.clone())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquire a connection for `provider_id`
    ///
    /// Fails with `PoolExhausted` when the wait queue is full, with
    /// `PoolAcquireTimeout` when a queued wait runs out, and with
    /// `ConnectionFailed` when the factory cannot create a connection.
    pub async fn acquire(&self, provider_id: &str) -> Result<PooledConnection<C>, ResilienceError> {
        let config = self.config_for(provider_id).await;

        let (mut rx, waiter_id, generation, acquire_timeout) = {
            let mut providers = self.inner.providers.lock().await;
            let pool = providers
                .entry(provider_id.to_string())
                .or_insert_with(|| ProviderPool::new(config, self.next_id()));

            if let Some(idle) = pool.available.pop() {
                pool.in_use.insert(idle.id, idle.conn.clone());
                return Ok(PooledConnection {
                    id: idle.id,
                    provider_id: provider_id.to_string(),
                    conn: idle.conn,
                });
            }

            if pool.busy() < pool.config.max_size {
                let slot = CreateSlot::reserve(&pool.creating);
                let generation = pool.generation;
                drop(providers);
                return self.create_connection(provider_id, generation, slot).await;
            }

            if pool.waiting.len() >= pool.config.max_waiting_clients {
                warn!(
                    provider = provider_id,
                    waiting = pool.waiting.len(),
                    "Connection pool exhausted"
                );
                return Err(ResilienceError::PoolExhausted {
                    provider_id: provider_id.to_string(),
                    max_waiting: pool.config.max_waiting_clients,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_id();
            pool.waiting.push_back(Waiter { id, tx });
            debug!(
                provider = provider_id,
                waiting = pool.waiting.len(),
                "Waiting for a pooled connection"
            );
            (rx, id, pool.generation, pool.config.acquire_timeout)
        };

        match tokio::time::timeout(acquire_timeout, &mut rx).await {
            Ok(Ok(Ok(grant))) => self.accept(provider_id, generation, grant).await,
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ResilienceError::PoolCleared(provider_id.to_string())),
            Err(_) => {
                let still_queued = {
                    let mut providers = self.inner.providers.lock().await;
                    match providers.get_mut(provider_id) {
                        Some(pool) => match pool.waiting.iter().position(|w| w.id == waiter_id) {
                            Some(pos) => {
                                pool.waiting.remove(pos);
                                true
                            }
                            None => false,
                        },
                        None => false,
                    }
                };

                // Granted between the timeout firing and the relock
                if !still_queued {
                    if let Ok(outcome) = rx.try_recv() {
                        return match outcome {
                            Ok(grant) => self.accept(provider_id, generation, grant).await,
                            Err(e) => Err(e),
                        };
                    }
                }

                warn!(
                    provider = provider_id,
                    timeout_ms = acquire_timeout.as_millis() as u64,
                    "Timed out waiting for a pooled connection"
                );
                Err(ResilienceError::PoolAcquireTimeout {
                    provider_id: provider_id.to_string(),
                    timeout: acquire_timeout,
                })
            }
        }
    }

    async fn accept(
        &self,
        provider_id: &str,
        generation: u64,
        grant: Grant<C>,
    ) -> Result<PooledConnection<C>, ResilienceError> {
        match grant {
            Grant::Connection(id, conn) => Ok(PooledConnection {
                id,
                provider_id: provider_id.to_string(),
                conn,
            }),
            Grant::Slot(slot) => self.create_connection(provider_id, generation, slot).await,
        }
    }

    /// Run the factory outside the lock, then account for the result
    async fn create_connection(
        &self,
        provider_id: &str,
        generation: u64,
        slot: CreateSlot,
    ) -> Result<PooledConnection<C>, ResilienceError> {
        let created = self.inner.factory.create(provider_id).await;

        let mut providers = self.inner.providers.lock().await;
        let pool = providers
            .get_mut(provider_id)
            .filter(|pool| pool.generation == generation);

        match (pool, created) {
            (Some(pool), Ok(conn)) => {
                let id = self.next_id();
                pool.in_use.insert(id, conn.clone());
                drop(slot);
                drop(providers);

                debug!(provider = provider_id, connection = id, "Created pooled connection");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_connection_success(provider_id).await;
                }
                Ok(PooledConnection {
                    id,
                    provider_id: provider_id.to_string(),
                    conn,
                })
            }
            (Some(pool), Err(e)) => {
                pool.hand_off_slot(slot);
                drop(providers);

                let err = Self::creation_error(e);
                warn!(provider = provider_id, error = %err, "Failed to create pooled connection");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_failure(provider_id, &err).await;
                }
                Err(err)
            }
            (None, Ok(conn)) => {
                drop(providers);
                debug!(provider = provider_id, "Pool cleared during create, discarding connection");
                Self::destroy(provider_id, conn).await;
                Err(ResilienceError::PoolCleared(provider_id.to_string()))
            }
            (None, Err(e)) => Err(Self::creation_error(e)),
        }
    }

    fn creation_error(err: ResilienceError) -> ResilienceError {
        match err {
            ResilienceError::ConnectionFailed { .. } => err,
            other => ResilienceError::ConnectionFailed {
                attempts: 1,
                reason: other.to_string(),
            },
        }
    }

    async fn destroy(provider_id: &str, conn: C) {
        if let Err(e) = conn.disconnect().await {
            warn!(provider = provider_id, error = %e, "Error while destroying connection");
        }
    }

    /// Return a connection to the pool
    ///
    /// Releasing a connection the pool does not track, including one that was
    /// already released, is a no-op.
    pub async fn release(&self, provider_id: &str, conn: PooledConnection<C>) {
        if conn.provider_id != provider_id {
            debug!(
                provider = provider_id,
                owner = %conn.provider_id,
                "Ignoring release of connection owned by another provider"
            );
            return;
        }

        let to_destroy = {
            let mut providers = self.inner.providers.lock().await;
            let Some(pool) = providers.get_mut(provider_id) else {
                return;
            };
            let Some(tracked) = pool.in_use.remove(&conn.id) else {
                debug!(provider = provider_id, connection = conn.id, "Ignoring release of untracked connection");
                return;
            };

            match pool.hand_off_connection(conn.id, tracked) {
                None => None,
                Some(unclaimed) if pool.available.len() < pool.config.min_size => {
                    pool.available.push(IdleConnection {
                        id: conn.id,
                        conn: unclaimed,
                        idle_since: Instant::now(),
                    });
                    None
                }
                Some(unclaimed) => Some(unclaimed),
            }
        };

        if let Some(surplus) = to_destroy {
            Self::destroy(provider_id, surplus).await;
        }
    }

    /// Destroy every connection for `provider_id`, fail its waiters and
    /// forget its config override
    pub async fn clear(&self, provider_id: &str) {
        self.inner.overrides.lock().await.remove(provider_id);
        let removed = self.inner.providers.lock().await.remove(provider_id);
        if let Some(pool) = removed {
            let conns = pool.drain(provider_id);
            info!(provider = provider_id, destroyed = conns.len(), "Cleared connection pool");
            for conn in conns {
                Self::destroy(provider_id, conn).await;
            }
        }
    }

    /// Destroy idle connections that exceeded `idle_timeout`
    ///
    /// Returns the number of connections evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, C)> = {
            let mut providers = self.inner.providers.lock().await;
            let mut expired = Vec::new();
            for (provider_id, pool) in providers.iter_mut() {
                let Some(idle_timeout) = pool.config.idle_timeout else {
                    continue;
                };
                let (stale, fresh): (Vec<_>, Vec<_>) = pool
                    .available
                    .drain(..)
                    .partition(|idle| now.duration_since(idle.idle_since) > idle_timeout);
                pool.available = fresh;
                expired.extend(stale.into_iter().map(|idle| (provider_id.clone(), idle.conn)));
            }
            expired
        };

        let count = expired.len();
        for (provider_id, conn) in expired {
            Self::destroy(&provider_id, conn).await;
        }
        if count > 0 {
            debug!(evicted = count, "Evicted idle connections");
        }
        count
    }

    /// Start periodic idle eviction, replacing any running reaper
    pub async fn start_reaper(&self, every: Duration) {
        let weak: Weak<PoolInner<C>> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionPool { inner }.evict_idle().await;
            }
        });

        if let Some(previous) = self.inner.reaper.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_reaper(&self) {
        if let Some(handle) = self.inner.reaper.lock().await.take() {
            handle.abort();
        }
    }

    /// Statistics for `provider_id`, or `None` if it has no pool yet
    pub async fn stats(&self, provider_id: &str) -> Option<PoolStats> {
        self.inner
            .providers
            .lock()
            .await
            .get(provider_id)
            .map(ProviderPool::stats)
    }

    /// Providers that currently have a pool
    pub async fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.providers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Clear every provider and stop the reaper
    pub async fn dispose(&self) {
        self.stop_reaper().await;
        let all: Vec<(String, ProviderPool<C>)> =
            self.inner.providers.lock().await.drain().collect();
        for (provider_id, pool) in all {
            for conn in pool.drain(&provider_id) {
                Self::destroy(&provider_id, conn).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone)]
    struct TestConnection {
        serial: usize,
        closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Poolable for TestConnection {
        async fn disconnect(&self) -> Result<(), ResilienceError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestFactory {
        counter: AtomicUsize,
        fail: AtomicBool,
        closed: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl TestFactory {
        async fn closed_count(&self) -> usize {
            self.closed
                .lock()
                .await
                .iter()
                .filter(|flag| flag.load(Ordering::SeqCst))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<TestConnection> for TestFactory {
        async fn create(&self, _provider_id: &str) -> Result<TestConnection, ResilienceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ResilienceError::message("ECONNREFUSED"));
            }
            let closed = Arc::new(AtomicBool::new(false));
            self.closed.lock().await.push(Arc::clone(&closed));
            Ok(TestConnection {
                serial: self.counter.fetch_add(1, Ordering::SeqCst),
                closed,
            })
        }
    }

    fn config(max_size: usize, max_waiting: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            min_size: 1,
            acquire_timeout: Duration::from_millis(500),
            idle_timeout: Some(Duration::from_secs(60)),
            max_waiting_clients: max_waiting,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_reuse() {
        let factory = Arc::new(TestFactory::default());
        let pool = ConnectionPool::new(factory.clone(), config(5, 10));

        let conn = pool.acquire("p").await.unwrap();
        assert_eq!(conn.serial, 0);
        pool.release("p", conn).await;

        let conn = pool.acquire("p").await.unwrap();
        assert_eq!(conn.serial, 0);
        assert_eq!(factory.counter.load(Ordering::SeqCst), 1);
        pool.release("p", conn).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_size_bounds_in_use() {
        let factory = Arc::new(TestFactory::default());
        let pool = ConnectionPool::new(factory.clone(), config(5, 10));

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire("p").await.unwrap());
        }

        let sixth = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("p").await })
        };
        tokio::task::yield_now().await;

        let stats = pool.stats("p").await.unwrap();
        assert_eq!(stats.in_use, 5);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.utilization(), 100.0);

        let first = held.remove(0);
        let first_id = first.id();
        pool.release("p", first).await;

        let handed = sixth.await.unwrap().unwrap();
        assert_eq!(handed.id(), first_id);
        assert_eq!(pool.stats("p").await.unwrap().in_use, 5);
        assert_eq!(factory.counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_removes_waiter() {
        let pool = ConnectionPool::new(Arc::new(TestFactory::default()), config(1, 10));
        let _held = pool.acquire("p").await.unwrap();

        let err = pool.acquire("p").await.unwrap_err();
        assert!(matches!(err, ResilienceError::PoolAcquireTimeout { .. }));
        assert_eq!(pool.stats("p").await.unwrap().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_queue_full() {
        let pool = ConnectionPool::new(Arc::new(TestFactory::default()), config(1, 1));
        let _held = pool.acquire("p").await.unwrap();

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("p").await })
        };
        tokio::task::yield_now().await;

        let err = pool.acquire("p").await.unwrap_err();
        assert!(matches!(err, ResilienceError::PoolExhausted { .. }));
        assert_eq!(err.kind(), Some(ErrorKind::PoolExhausted));

        queued.abort();
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let pool = ConnectionPool::new(Arc::new(TestFactory::default()), config(5, 10));
        let conn = pool.acquire("p").await.unwrap();
        let copy = conn.clone();

        pool.release("p", conn).await;
        pool.release("p", copy).await;

        let stats = pool.stats("p").await.unwrap();
        assert_eq!(stats.available, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_release_beyond_min_size_destroys() {
        let factory = Arc::new(TestFactory::default());
        let pool = ConnectionPool::new(factory.clone(), config(5, 10));

        let a = pool.acquire("p").await.unwrap();
        let b = pool.acquire("p").await.unwrap();
        pool.release("p", a).await;
        pool.release("p", b).await;

        let stats = pool.stats("p").await.unwrap();
        assert_eq!(stats.available, 1);
        assert_eq!(factory.closed_count().await, 1);
    }

    #[tokio::test]
    async fn test_factory_failure_is_connection_failed() {
        let factory = Arc::new(TestFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let metrics = Arc::new(MetricsTracker::new());
        let pool = ConnectionPool::with_metrics(factory, config(5, 10), metrics.clone());

        let err = pool.acquire("p").await.unwrap_err();
        assert!(matches!(err, ResilienceError::ConnectionFailed { .. }));

        let m = metrics.metrics("p").await;
        assert_eq!(m.failed_requests, 1);
        assert_eq!(m.errors.get("CONNECTION_FAILED"), Some(&1));
        assert_eq!(pool.stats("p").await.unwrap().creating, 0);
    }

    #[tokio::test]
    async fn test_successful_create_counts_connection() {
        let metrics = Arc::new(MetricsTracker::new());
        let pool = ConnectionPool::with_metrics(
            Arc::new(TestFactory::default()),
            config(5, 10),
            metrics.clone(),
        );

        let conn = pool.acquire("p").await.unwrap();
        pool.release("p", conn).await;
        assert_eq!(metrics.metrics("p").await.connections_established, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_hands_slot_to_waiter() {
        let factory = Arc::new(TestFactory::default());
        let pool = ConnectionPool::new(factory.clone(), config(1, 10));

        let held = pool.acquire("p").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("p").await })
        };
        tokio::task::yield_now().await;

        // Free the only slot without handing a connection over
        {
            let mut providers = pool.inner.providers.lock().await;
            let p = providers.get_mut("p").unwrap();
            p.in_use.remove(&held.id());
            let slot = CreateSlot::reserve(&p.creating);
            p.hand_off_slot(slot);
        }

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.serial, 1);
        assert_eq!(pool.stats("p").await.unwrap().in_use, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_rejects_waiters_and_destroys() {
        let factory = Arc::new(TestFactory::default());
        let pool = ConnectionPool::new(factory.clone(), config(1, 10));
        let _held = pool.acquire("p").await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("p").await })
        };
        tokio::task::yield_now().await;

        pool.clear("p").await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ResilienceError::PoolCleared(_)));
        assert_eq!(factory.closed_count().await, 1);
        assert!(pool.stats("p").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_forgets_override() {
        let pool = ConnectionPool::new(Arc::new(TestFactory::default()), config(5, 10));
        pool.set_config("p", config(1, 0)).await;
        let conn = pool.acquire("p").await.unwrap();
        pool.release("p", conn).await;

        pool.clear("p").await;
        assert_eq!(pool.config_for("p").await, config(5, 10));

        let _a = pool.acquire("p").await.unwrap();
        let _b = pool.acquire("p").await.unwrap();
        assert_eq!(pool.stats("p").await.unwrap().max_size, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction() {
        let factory = Arc::new(TestFactory::default());
        let pool = ConnectionPool::new(factory.clone(), config(5, 10));

        let conn = pool.acquire("p").await.unwrap();
        pool.release("p", conn).await;
        assert_eq!(pool.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(pool.stats("p").await.unwrap().available, 0);
        assert_eq!(factory.closed_count().await, 1);
    }

    #[tokio::test]
    async fn test_providers_are_isolated() {
        let pool = ConnectionPool::new(Arc::new(TestFactory::default()), config(1, 0));
        let _a = pool.acquire("a").await.unwrap();
        let _b = pool.acquire("b").await.unwrap();
        assert_eq!(pool.providers().await, vec!["a".to_string(), "b".to_string()]);
    }
}
