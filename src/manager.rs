//! ConnectionManager: per-provider connection state machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──success──▶ Connected
//!                                 │                      │
//!                          retries exhausted      transport error /
//!                                 ▼               health beyond threshold
//!                               Error ◀──────────────────┘
//!                                 │  ▲
//!               transport error   │  │ exhausted
//!                                 ▼  │
//!                             Reconnecting ──success──▶ Connected
//!
//! Connected / Error ──disconnect()──▶ Disconnected
//! ```
//!
//! Lifecycle operations (`connect`, `disconnect`, recovery) are serialized per
//! provider. While connected, a background loop probes the provider through
//! the shared [`HealthMonitor`] every `check_interval`.

use crate::provider::{HealthCheckable, Provider};
use chrono::Utc;
use std::sync::{Arc, Weak};
use tether_core_resilience::{
    ConnectionEventData, ConnectionState, ConnectionStatus, EventBus, HealthCheckConfig,
    HealthMonitor, HealthStatus, MetricsTracker, ResilienceError, ResilienceEvent, RetryConfig,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a reported connection error was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Reconnected; the provider is `Connected` again
    Recovered,
    /// Reconnect attempts exhausted; `Error` until an explicit `connect()`
    Exhausted,
    /// Not a transport error, or the provider was disconnected meanwhile
    NotRetried,
}

#[derive(Debug, Default)]
struct Lifecycle {
    state: ConnectionState,
    status: ConnectionStatus,
    /// Reconnect attempts since the last `connect()` or healthy probe
    attempts: u32,
}

struct Shared {
    provider_id: String,
    provider: Arc<dyn Provider>,
    probe: Arc<dyn HealthCheckable>,
    retry: RetryConfig,
    health_config: HealthCheckConfig,
    monitor: HealthMonitor,
    metrics: Arc<MetricsTracker>,
    events: EventBus,
    /// Serializes connect, disconnect and recovery
    transition: Mutex<()>,
    lifecycle: RwLock<Lifecycle>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

/// Connection state machine for one provider
///
/// Cloning yields another handle onto the same state machine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tether::manager::ConnectionManager;
/// use tether::provider::Connectable;
/// use tether_core_resilience::{
///     EventBus, HealthCheckConfig, HealthCheckResponse, HealthCheckable, HealthMonitor,
///     MetricsTracker, ResilienceError, RetryConfig, RetryHandler,
/// };
///
/// struct Local;
///
/// #[async_trait::async_trait]
/// impl Connectable for Local {
///     async fn establish_connection(&self) -> Result<(), ResilienceError> { Ok(()) }
///     async fn terminate_connection(&self) -> Result<(), ResilienceError> { Ok(()) }
/// }
///
/// #[async_trait::async_trait]
/// impl HealthCheckable for Local {
///     async fn perform_health_check(&self) -> Result<HealthCheckResponse, ResilienceError> {
///         Ok(HealthCheckResponse::ok())
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let events = EventBus::default();
/// let metrics = Arc::new(MetricsTracker::new());
/// let monitor = HealthMonitor::new(metrics.clone(), Arc::new(RetryHandler::new()), events.clone());
///
/// let manager = ConnectionManager::new(
///     "local",
///     Arc::new(Local),
///     RetryConfig::default(),
///     HealthCheckConfig::default(),
///     monitor,
///     metrics,
///     events,
/// );
/// manager.connect().await?;
/// manager.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("provider_id", &self.shared.provider_id)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new<P: Provider + 'static>(
        provider_id: &str,
        provider: Arc<P>,
        retry: RetryConfig,
        health_config: HealthCheckConfig,
        monitor: HealthMonitor,
        metrics: Arc<MetricsTracker>,
        events: EventBus,
    ) -> Self {
        let probe: Arc<dyn HealthCheckable> = provider.clone();
        Self {
            shared: Arc::new(Shared {
                provider_id: provider_id.to_string(),
                provider,
                probe,
                retry,
                health_config,
                monitor,
                metrics,
                events,
                transition: Mutex::new(()),
                lifecycle: RwLock::new(Lifecycle::default()),
                health_task: Mutex::new(None),
                recovery_task: Mutex::new(None),
            }),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.shared.provider_id
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.lifecycle.read().await.state
    }

    /// Copy of the current status
    pub async fn status(&self) -> ConnectionStatus {
        self.shared.lifecycle.read().await.status.clone()
    }

    pub async fn attempts(&self) -> u32 {
        self.shared.lifecycle.read().await.attempts
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Connect, retrying `establish_connection` with exponential backoff
    ///
    /// Succeeds immediately when already connected. After `max_attempts`
    /// failures the state is `Error` and `ConnectionFailed` carries the attempt
    /// count and the last underlying error.
    pub async fn connect(&self) -> Result<(), ResilienceError> {
        let shared = &self.shared;
        let _transition = shared.transition.lock().await;

        {
            let mut lifecycle = shared.lifecycle.write().await;
            if lifecycle.state == ConnectionState::Connected {
                return Ok(());
            }
            lifecycle.attempts = 0;
            lifecycle.state = ConnectionState::Connecting;
            lifecycle.status.error = None;
        }
        self.emit_state_changed().await;
        info!(provider = %shared.provider_id, "Connecting");

        let max_attempts = shared.retry.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..max_attempts {
            match shared.provider.establish_connection().await {
                Ok(()) => {
                    self.mark_connected().await;
                    self.start_health_loop().await;
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        provider = %shared.provider_id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(shared.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        let err = ResilienceError::ConnectionFailed {
            attempts: max_attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        };
        {
            let mut lifecycle = shared.lifecycle.write().await;
            lifecycle.state = ConnectionState::Error;
            lifecycle.status.connected = false;
            lifecycle.status.available = false;
            lifecycle.status.error = Some(err.to_string());
            lifecycle.attempts = 0;
        }
        error!(provider = %shared.provider_id, error = %err, "Connection failed");
        shared.metrics.record_failure(&shared.provider_id, &err).await;
        self.emit_error(&err);
        self.emit_state_changed().await;
        Err(err)
    }

    /// Stop health checks, terminate the connection and reset status
    ///
    /// Safe to call in any state. Errors from `terminate_connection` are logged
    /// and swallowed.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        self.stop_background_tasks().await;
        let _transition = shared.transition.lock().await;
        // A connect or recovery that held the lock may have started a new loop
        self.stop_background_tasks().await;

        let was = shared.lifecycle.read().await.state;
        if was != ConnectionState::Disconnected {
            if let Err(e) = shared.provider.terminate_connection().await {
                warn!(provider = %shared.provider_id, error = %e, "Error while terminating connection");
            }
        }

        {
            let mut lifecycle = shared.lifecycle.write().await;
            lifecycle.state = ConnectionState::Disconnected;
            lifecycle.status = ConnectionStatus::default();
        }
        if was != ConnectionState::Disconnected {
            info!(provider = %shared.provider_id, "Disconnected");
        }
        shared.events.emit(ResilienceEvent::Disconnected {
            provider_id: shared.provider_id.clone(),
        });
        self.emit_state_changed().await;
    }

    /// Record `err`, then reconnect if it is a transport failure
    ///
    /// Health checks stop unless the provider recovered.
    pub async fn handle_connection_error(&self, err: ResilienceError) -> RecoveryOutcome {
        let outcome = self.recover(err).await;
        if outcome != RecoveryOutcome::Recovered {
            self.stop_health_loop().await;
        } else if !self.is_monitoring().await {
            self.start_health_loop().await;
        }
        outcome
    }

    /// Run [`handle_connection_error`](Self::handle_connection_error) in the
    /// background; dropped if a recovery is already running
    pub async fn report_error(&self, err: ResilienceError) {
        let mut slot = self.shared.recovery_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(provider = %self.shared.provider_id, error = %err, "Recovery already running");
            return;
        }
        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            manager.handle_connection_error(err).await;
        }));
    }

    async fn recover(&self, err: ResilienceError) -> RecoveryOutcome {
        let shared = &self.shared;
        let _transition = shared.transition.lock().await;

        {
            let mut lifecycle = shared.lifecycle.write().await;
            if lifecycle.state == ConnectionState::Disconnected {
                return RecoveryOutcome::NotRetried;
            }
            lifecycle.state = ConnectionState::Error;
            lifecycle.status.connected = false;
            lifecycle.status.available = false;
            lifecycle.status.error = Some(err.to_string());
        }
        warn!(provider = %shared.provider_id, error = %err, "Connection error");
        self.emit_error(&err);
        self.emit_state_changed().await;

        if !err.is_transport_error() {
            return RecoveryOutcome::NotRetried;
        }

        let max_attempts = shared.retry.max_attempts;
        loop {
            let (attempt, delay) = {
                let mut lifecycle = shared.lifecycle.write().await;
                if lifecycle.attempts >= max_attempts {
                    break;
                }
                let delay = shared.retry.delay_for_attempt(lifecycle.attempts);
                lifecycle.attempts += 1;
                lifecycle.state = ConnectionState::Reconnecting;
                (lifecycle.attempts, delay)
            };

            info!(
                provider = %shared.provider_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            shared.events.emit(ResilienceEvent::Reconnecting {
                provider_id: shared.provider_id.clone(),
                attempt,
                delay,
            });
            self.emit_state_changed().await;
            tokio::time::sleep(delay).await;

            match shared.provider.establish_connection().await {
                Ok(()) => {
                    self.mark_connected().await;
                    return RecoveryOutcome::Recovered;
                }
                Err(e) => {
                    warn!(provider = %shared.provider_id, attempt, error = %e, "Reconnect attempt failed");
                    let mut lifecycle = shared.lifecycle.write().await;
                    lifecycle.state = ConnectionState::Error;
                    lifecycle.status.error = Some(e.to_string());
                }
            }
        }

        let exhausted = ResilienceError::ConnectionFailed {
            attempts: max_attempts,
            reason: shared
                .lifecycle
                .read()
                .await
                .status
                .error
                .clone()
                .unwrap_or_else(|| err.to_string()),
        };
        {
            let mut lifecycle = shared.lifecycle.write().await;
            lifecycle.state = ConnectionState::Error;
            lifecycle.status.error = Some(exhausted.to_string());
        }
        error!(provider = %shared.provider_id, error = %exhausted, "Reconnect attempts exhausted");
        self.emit_error(&exhausted);
        self.emit_state_changed().await;
        RecoveryOutcome::Exhausted
    }

    async fn mark_connected(&self) {
        let shared = &self.shared;
        {
            let mut lifecycle = shared.lifecycle.write().await;
            lifecycle.state = ConnectionState::Connected;
            lifecycle.status.connected = true;
            lifecycle.status.available = true;
            lifecycle.status.error = None;
        }
        info!(provider = %shared.provider_id, "Connected");
        shared.monitor.reset_health(&shared.provider_id).await;
        shared.metrics.record_connection_success(&shared.provider_id).await;
        shared.events.emit(ResilienceEvent::Connected {
            provider_id: shared.provider_id.clone(),
        });
        self.emit_state_changed().await;
    }

    async fn start_health_loop(&self) {
        let shared = &self.shared;
        if self.state().await != ConnectionState::Connected {
            return;
        }
        shared
            .monitor
            .register(
                &shared.provider_id,
                Arc::clone(&shared.probe),
                shared.health_config.clone(),
            )
            .await;

        let every = shared.health_config.check_interval;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let manager = ConnectionManager { shared };
                if !manager.run_health_check().await {
                    break;
                }
            }
        });

        if let Some(previous) = shared.health_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// One scheduled probe; returns `false` when the loop should stop
    async fn run_health_check(&self) -> bool {
        let shared = &self.shared;
        if self.state().await == ConnectionState::Disconnected {
            return false;
        }
        let outcome = match shared.monitor.check_now(&shared.provider_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(provider = %shared.provider_id, error = %e, "Health check unavailable");
                return false;
            }
        };

        match (outcome.response, outcome.error) {
            (Some(response), None) => {
                let changed_status = {
                    let mut lifecycle = shared.lifecycle.write().await;
                    lifecycle.attempts = 0;
                    lifecycle.status.last_checked = Some(Utc::now());
                    lifecycle
                        .status
                        .merge_response(&response)
                        .then(|| lifecycle.status.clone())
                };
                if let Some(status) = changed_status {
                    debug!(provider = %shared.provider_id, models = status.models.len(), "Models changed");
                    shared.events.emit(ResilienceEvent::ModelChanged {
                        provider_id: shared.provider_id.clone(),
                        status,
                    });
                }
                true
            }
            (_, Some(err)) => {
                if matches!(
                    outcome.health.status,
                    HealthStatus::Unhealthy | HealthStatus::Failed
                ) {
                    self.recover(err).await == RecoveryOutcome::Recovered
                } else {
                    debug!(
                        provider = %shared.provider_id,
                        failures = outcome.health.consecutive_failures,
                        "Health check failed below threshold"
                    );
                    true
                }
            }
            (None, None) => true,
        }
    }

    async fn stop_health_loop(&self) {
        if let Some(task) = self.shared.health_task.lock().await.take() {
            task.abort();
        }
    }

    async fn stop_background_tasks(&self) {
        self.stop_health_loop().await;
        if let Some(task) = self.shared.recovery_task.lock().await.take() {
            task.abort();
        }
    }

    /// Whether the periodic health loop is running
    pub async fn is_monitoring(&self) -> bool {
        self.shared
            .health_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn emit_error(&self, err: &ResilienceError) {
        self.shared.events.emit(ResilienceEvent::Error {
            provider_id: self.shared.provider_id.clone(),
            message: err.to_string(),
        });
    }

    async fn emit_state_changed(&self) {
        let data = {
            let lifecycle = self.shared.lifecycle.read().await;
            ConnectionEventData {
                provider_id: self.shared.provider_id.clone(),
                state: lifecycle.state,
                status: lifecycle.status.clone(),
                error: lifecycle.status.error.clone(),
            }
        };
        self.shared.events.emit(ResilienceEvent::StateChanged(data));
    }
}
