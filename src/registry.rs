//! ProviderRegistry: composition root for the resilience layer
//!
//! One registry owns a single event bus, metrics tracker, retry handler,
//! health monitor, rate limiter and connection pool, and one
//! [`ConnectionManager`] per registered provider. Requests go through
//! [`ProviderRegistry::execute`]:
//!
//! ```text
//! token (rate limiter) → pooled connection → op → metrics → release
//!                                             │
//!                                   transport error → state machine
//! ```

use crate::config::ResilienceSettings;
use crate::manager::ConnectionManager;
use crate::provider::{ConnectionFactory, Poolable, Provider};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_core_resilience::{
    ConnectionMetrics, ConnectionPool, ConnectionState, ConnectionStatus, EventBus,
    EventReceiver, HealthMonitor, MetricsTracker, PoolStats, PooledConnection, ProviderHealth,
    RateLimiter, ResilienceError, RetryHandler,
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Dispatches pool creation to the factory registered for each provider
struct RoutingFactory<C> {
    factories: RwLock<HashMap<String, Arc<dyn ConnectionFactory<C>>>>,
}

#[async_trait::async_trait]
impl<C: Poolable> ConnectionFactory<C> for RoutingFactory<C> {
    async fn create(&self, provider_id: &str) -> Result<C, ResilienceError> {
        let factory = self
            .factories
            .read()
            .await
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ResilienceError::ProviderNotFound(provider_id.to_string()))?;
        factory.create(provider_id).await
    }
}

/// A connection checked out by `execute`
///
/// Dropping it unreleased (the caller's future was cancelled) hands the
/// connection back on a spawned task.
struct Checkout<C: Poolable> {
    pool: ConnectionPool<C>,
    provider_id: String,
    conn: Option<PooledConnection<C>>,
}

impl<C: Poolable> Checkout<C> {
    async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&self.provider_id, conn).await;
        }
    }
}

impl<C: Poolable> Drop for Checkout<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let provider_id = std::mem::take(&mut self.provider_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(provider = %provider_id, "Request cancelled, returning connection");
                let pool = self.pool.clone();
                runtime.spawn(async move {
                    pool.release(&provider_id, conn).await;
                });
            }
            Err(_) => {
                warn!(provider = %provider_id, "No runtime to return cancelled connection to the pool")
            }
        }
    }
}

/// Registry of providers sharing one set of resilience components
///
/// `C` is the pooled connection type every registered provider produces.
pub struct ProviderRegistry<C: Poolable> {
    events: EventBus,
    metrics: Arc<MetricsTracker>,
    retry: Arc<RetryHandler>,
    monitor: HealthMonitor,
    limiter: RateLimiter,
    pool: ConnectionPool<C>,
    factories: Arc<RoutingFactory<C>>,
    managers: Arc<RwLock<HashMap<String, ConnectionManager>>>,
}

impl<C: Poolable> ProviderRegistry<C> {
    /// Create an empty registry; `defaults` apply to components shared by all providers
    pub fn new(defaults: &ResilienceSettings) -> Self {
        let events = EventBus::default();
        let metrics = Arc::new(MetricsTracker::new().with_events(events.clone()));
        let retry = Arc::new(RetryHandler::new().with_events(events.clone()));
        let monitor = HealthMonitor::new(metrics.clone(), retry.clone(), events.clone());
        let factories = Arc::new(RoutingFactory {
            factories: RwLock::new(HashMap::new()),
        });
        let pool = ConnectionPool::with_metrics(
            factories.clone(),
            defaults.pool_config(),
            metrics.clone(),
        );

        Self {
            events,
            metrics,
            retry,
            monitor,
            limiter: RateLimiter::new(defaults.rate_limit_config()),
            pool,
            factories,
            managers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a provider with its effective settings
    ///
    /// The provider starts out `Disconnected`.
    pub async fn register<P>(
        &self,
        provider_id: &str,
        provider: Arc<P>,
        settings: &ResilienceSettings,
    ) -> Result<ConnectionManager, ResilienceError>
    where
        P: Provider + ConnectionFactory<C> + 'static,
    {
        settings.validate()?;

        let mut managers = self.managers.write().await;
        if managers.contains_key(provider_id) {
            return Err(ResilienceError::InvalidConfiguration(format!(
                "provider '{}' is already registered",
                provider_id
            )));
        }

        self.limiter
            .set_config(provider_id, settings.rate_limit_config())
            .await;
        self.pool
            .set_config(provider_id, settings.pool_config())
            .await;
        let factory: Arc<dyn ConnectionFactory<C>> = provider.clone();
        self.factories
            .factories
            .write()
            .await
            .insert(provider_id.to_string(), factory);

        let manager = ConnectionManager::new(
            provider_id,
            provider,
            settings.retry_config(),
            settings.health_config(),
            self.monitor.clone(),
            self.metrics.clone(),
            self.events.clone(),
        );
        managers.insert(provider_id.to_string(), manager.clone());
        info!(provider = provider_id, "Registered provider");
        Ok(manager)
    }

    /// Disconnect and forget a provider, releasing everything it held
    pub async fn unregister(&self, provider_id: &str) -> Result<(), ResilienceError> {
        let manager = self
            .managers
            .write()
            .await
            .remove(provider_id)
            .ok_or_else(|| ResilienceError::ProviderNotFound(provider_id.to_string()))?;

        manager.disconnect().await;
        self.monitor.unregister(provider_id).await;
        self.pool.clear(provider_id).await;
        self.limiter.clear(provider_id).await;
        self.metrics.remove(provider_id).await;
        self.factories.factories.write().await.remove(provider_id);

        info!(provider = provider_id, "Unregistered provider");
        Ok(())
    }

    /// State machine for `provider_id`
    pub async fn manager(&self, provider_id: &str) -> Result<ConnectionManager, ResilienceError> {
        self.managers
            .read()
            .await
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ResilienceError::ProviderNotFound(provider_id.to_string()))
    }

    pub async fn connect(&self, provider_id: &str) -> Result<(), ResilienceError> {
        self.manager(provider_id).await?.connect().await
    }

    pub async fn disconnect(&self, provider_id: &str) -> Result<(), ResilienceError> {
        self.manager(provider_id).await?.disconnect().await;
        Ok(())
    }

    pub async fn status(&self, provider_id: &str) -> Result<ConnectionStatus, ResilienceError> {
        Ok(self.manager(provider_id).await?.status().await)
    }

    pub async fn state(&self, provider_id: &str) -> Result<ConnectionState, ResilienceError> {
        Ok(self.manager(provider_id).await?.state().await)
    }

    /// Take a rate-limit token, then a pooled connection
    pub async fn acquire(&self, provider_id: &str) -> Result<PooledConnection<C>, ResilienceError> {
        self.manager(provider_id).await?;
        self.limiter.acquire_token(provider_id).await?;
        self.pool.acquire(provider_id).await
    }

    pub async fn release(&self, provider_id: &str, conn: PooledConnection<C>) {
        self.pool.release(provider_id, conn).await;
    }

    /// Run `op` against a pooled connection for `provider_id`
    ///
    /// The outcome is recorded in the metrics tracker and the connection is
    /// always released, also when the returned future is dropped mid-request.
    /// Transport failures are also reported to the provider's state machine,
    /// which reconnects in the background.
    pub async fn execute<F, Fut, T>(&self, provider_id: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let manager = self.manager(provider_id).await?;
        let conn = self.acquire(provider_id).await?;
        let handle = conn.connection().clone();
        let checkout = Checkout {
            pool: self.pool.clone(),
            provider_id: provider_id.to_string(),
            conn: Some(conn),
        };

        let started = Instant::now();
        let result = op(handle).await;
        let elapsed = started.elapsed();
        checkout.release().await;

        match &result {
            Ok(_) => self.metrics.record_request(provider_id, elapsed).await,
            Err(e) => {
                debug!(provider = provider_id, error = %e, "Request failed");
                self.metrics.record_failure(provider_id, e).await;
                if e.is_transport_error() {
                    manager.report_error(e.clone()).await;
                }
            }
        }
        result
    }

    /// Subscribe to every notification from every provider
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn metrics(&self, provider_id: &str) -> ConnectionMetrics {
        self.metrics.metrics(provider_id).await
    }

    pub async fn all_metrics(&self) -> BTreeMap<String, ConnectionMetrics> {
        self.metrics.snapshot_all().await
    }

    pub async fn health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.monitor.health(provider_id).await
    }

    pub async fn all_health(&self) -> BTreeMap<String, ProviderHealth> {
        self.monitor.all_health().await
    }

    pub async fn pool_stats(&self, provider_id: &str) -> Option<PoolStats> {
        self.pool.stats(provider_id).await
    }

    pub async fn available_tokens(&self, provider_id: &str) -> f64 {
        self.limiter.available_tokens(provider_id).await
    }

    /// Registered provider ids, sorted
    pub async fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.managers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start the metrics sweeper and the idle-connection reaper
    pub async fn start_maintenance(&self, every: Duration) {
        self.metrics.start_sweeper(every).await;
        self.pool.start_reaper(every).await;
    }

    /// Disconnect every provider and stop all background work
    pub async fn shutdown(&self) {
        let managers: Vec<ConnectionManager> = self.managers.read().await.values().cloned().collect();
        for manager in managers {
            manager.disconnect().await;
        }

        self.monitor.dispose().await;
        self.pool.dispose().await;
        self.limiter.dispose().await;
        self.metrics.stop_sweeper().await;
        self.retry.cancel_all().await;
        info!("Provider registry shut down");
    }
}
