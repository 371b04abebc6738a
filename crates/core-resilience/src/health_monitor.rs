//! Health Monitor: periodic provider probes with threshold hysteresis
//!
//! Each registered provider owns a [`ProviderHealth`] record that only this
//! module mutates. A probe runs the provider's health check through the retry
//! handler, bounded by the configured timeout, and folds the outcome into the
//! record:
//!
//! - success resets the failure streak and promotes to `Healthy` once
//!   `healthy_threshold` consecutive successes are seen
//! - failure resets the success streak, demotes to `Unhealthy` at
//!   `unhealthy_threshold` and to `Failed` at `max_consecutive_failures`
//!
//! Status only moves when a streak reaches its threshold, so a single success
//! never undoes `Failed`.
//!
//! # Example
//!
//! ```no_run
//! use tether_core_resilience::health_monitor::{HealthCheckConfig, HealthCheckable, HealthMonitor};
//! use tether_core_resilience::{EventBus, HealthCheckResponse, MetricsTracker, ResilienceError, RetryHandler};
//! use std::sync::Arc;
//!
//! struct Ollama;
//!
//! #[async_trait::async_trait]
//! impl HealthCheckable for Ollama {
//!     async fn perform_health_check(&self) -> Result<HealthCheckResponse, ResilienceError> {
//!         Ok(HealthCheckResponse::ok().with_models(["llama3"]))
//!     }
//! }
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let monitor = HealthMonitor::new(
//!     Arc::new(MetricsTracker::new()),
//!     Arc::new(RetryHandler::new()),
//!     EventBus::default(),
//! );
//! monitor
//!     .register("ollama", Arc::new(Ollama), HealthCheckConfig::default())
//!     .await;
//!
//! let outcome = monitor.check_now("ollama").await?;
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```

use crate::error::ResilienceError;
use crate::events::{EventBus, ResilienceEvent};
use crate::metrics::MetricsTracker;
use crate::retry::{RetryConfig, RetryHandler};
use crate::state::HealthCheckResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Something that can report on its own health
#[async_trait::async_trait]
pub trait HealthCheckable: Send + Sync {
    async fn perform_health_check(&self) -> Result<HealthCheckResponse, ResilienceError>;
}

/// Derived health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Failed,
}

/// Health record for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    fn record_success(&mut self, config: &HealthCheckConfig) {
        let now = Utc::now();
        self.total_checks += 1;
        self.last_check_time = Some(now);
        self.last_success_time = Some(now);
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.last_error = None;
        if self.consecutive_successes >= config.healthy_threshold {
            self.status = HealthStatus::Healthy;
        }
    }

    /// Returns `true` when this failure moved the provider into `Failed`
    fn record_failure(&mut self, config: &HealthCheckConfig, message: String) -> bool {
        let previous = self.status;
        self.total_checks += 1;
        self.last_check_time = Some(Utc::now());
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        self.last_error = Some(message);

        if self.consecutive_failures >= config.max_consecutive_failures {
            self.status = HealthStatus::Failed;
        } else if self.consecutive_failures >= config.unhealthy_threshold
            && self.status != HealthStatus::Failed
        {
            self.status = HealthStatus::Unhealthy;
        }
        self.status == HealthStatus::Failed && previous != HealthStatus::Failed
    }
}

/// Probe configuration for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// Time between scheduled probes
    pub check_interval: Duration,
    /// Upper bound on a whole probe, retries included
    pub timeout: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub max_consecutive_failures: u32,
    /// Retry policy applied to the health check call inside a probe
    pub retry: RetryConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            max_consecutive_failures: 5,
            retry: RetryConfig::default(),
        }
    }
}

/// Result of a single probe
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Health record after the probe was applied
    pub health: ProviderHealth,
    pub response: Option<HealthCheckResponse>,
    pub error: Option<ResilienceError>,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct MonitoredProvider {
    probe: Arc<dyn HealthCheckable>,
    config: HealthCheckConfig,
    health: ProviderHealth,
    task: Option<JoinHandle<()>>,
}

struct MonitorInner {
    providers: Mutex<HashMap<String, MonitoredProvider>>,
    metrics: Arc<MetricsTracker>,
    retry: Arc<RetryHandler>,
    events: EventBus,
}

/// Tracks provider health from periodic probes
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(metrics: Arc<MetricsTracker>, retry: Arc<RetryHandler>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                providers: Mutex::new(HashMap::new()),
                metrics,
                retry,
                events,
            }),
        }
    }

    /// Register `probe` for `provider_id`
    ///
    /// Registering again swaps the probe and config but keeps the health record.
    pub async fn register(
        &self,
        provider_id: &str,
        probe: Arc<dyn HealthCheckable>,
        config: HealthCheckConfig,
    ) {
        let mut providers = self.inner.providers.lock().await;
        match providers.get_mut(provider_id) {
            Some(existing) => {
                existing.probe = probe;
                existing.config = config;
            }
            None => {
                providers.insert(
                    provider_id.to_string(),
                    MonitoredProvider {
                        probe,
                        config,
                        health: ProviderHealth::default(),
                        task: None,
                    },
                );
                debug!(provider = provider_id, "Registered for health monitoring");
            }
        }
    }

    /// Stop monitoring and forget `provider_id`
    pub async fn unregister(&self, provider_id: &str) -> bool {
        let removed = self.inner.providers.lock().await.remove(provider_id);
        self.inner.retry.cancel(provider_id).await;
        match removed {
            Some(entry) => {
                if let Some(task) = entry.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Start the periodic probe loop, replacing any loop already running
    pub async fn start_monitoring(&self, provider_id: &str) -> Result<(), ResilienceError> {
        let mut providers = self.inner.providers.lock().await;
        let entry = providers
            .get_mut(provider_id)
            .ok_or_else(|| ResilienceError::ProviderNotFound(provider_id.to_string()))?;

        if let Some(previous) = entry.task.take() {
            previous.abort();
        }

        let every = entry.config.check_interval;
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let id = provider_id.to_string();
        entry.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let monitor = HealthMonitor { inner };
                if let Err(ResilienceError::ProviderNotFound(_)) = monitor.check_now(&id).await {
                    break;
                }
            }
        }));

        info!(
            provider = provider_id,
            interval_ms = every.as_millis() as u64,
            "Health monitoring started"
        );
        Ok(())
    }

    pub async fn stop_monitoring(&self, provider_id: &str) {
        let task = self
            .inner
            .providers
            .lock()
            .await
            .get_mut(provider_id)
            .and_then(|entry| entry.task.take());
        if let Some(task) = task {
            task.abort();
            debug!(provider = provider_id, "Health monitoring stopped");
        }
    }

    /// Run one probe immediately and fold it into the health record
    ///
    /// Only fails with `ProviderNotFound`; probe failures are reported in the
    /// returned outcome.
    pub async fn check_now(&self, provider_id: &str) -> Result<ProbeOutcome, ResilienceError> {
        let (probe, config) = {
            let providers = self.inner.providers.lock().await;
            let entry = providers
                .get(provider_id)
                .ok_or_else(|| ResilienceError::ProviderNotFound(provider_id.to_string()))?;
            (Arc::clone(&entry.probe), entry.config.clone())
        };

        let started = Instant::now();
        let result = self.probe(provider_id, probe, &config).await;
        let elapsed = started.elapsed();

        let (health, entered_failed) = {
            let mut providers = self.inner.providers.lock().await;
            // Unregistered while the probe was in flight
            let entry = providers
                .get_mut(provider_id)
                .ok_or_else(|| ResilienceError::ProviderNotFound(provider_id.to_string()))?;
            let entered_failed = match &result {
                Ok(_) => {
                    entry.health.record_success(&entry.config);
                    false
                }
                Err(e) => entry.health.record_failure(&entry.config, e.to_string()),
            };
            (entry.health.clone(), entered_failed)
        };

        match &result {
            Ok(_) => {
                self.inner.metrics.record_request(provider_id, elapsed).await;
            }
            Err(e) => {
                warn!(
                    provider = provider_id,
                    failures = health.consecutive_failures,
                    status = ?health.status,
                    error = %e,
                    "Health check failed"
                );
                self.inner.metrics.record_failure(provider_id, e).await;
                self.inner.events.emit(ResilienceEvent::HealthCheckFailed {
                    provider_id: provider_id.to_string(),
                    message: e.to_string(),
                });
            }
        }

        self.inner.events.emit(ResilienceEvent::HealthUpdated {
            provider_id: provider_id.to_string(),
            health: health.clone(),
        });

        if entered_failed {
            let message = health.last_error.clone().unwrap_or_default();
            error!(provider = provider_id, error = %message, "Provider marked as failed");
            self.inner.events.emit(ResilienceEvent::ProviderFailed {
                provider_id: provider_id.to_string(),
                error: message,
                health: health.clone(),
            });
        }

        Ok(match result {
            Ok(response) => ProbeOutcome {
                health,
                response: Some(response),
                error: None,
            },
            Err(e) => ProbeOutcome {
                health,
                response: None,
                error: Some(e),
            },
        })
    }

    async fn probe(
        &self,
        provider_id: &str,
        probe: Arc<dyn HealthCheckable>,
        config: &HealthCheckConfig,
    ) -> Result<HealthCheckResponse, ResilienceError> {
        let attempt = || {
            let probe = Arc::clone(&probe);
            async move {
                let response = probe.perform_health_check().await?;
                if response.is_ok() {
                    Ok(response)
                } else {
                    Err(ResilienceError::HealthCheckFailed(
                        response
                            .message
                            .unwrap_or_else(|| "provider reported an error status".to_string()),
                    ))
                }
            }
        };

        match tokio::time::timeout(
            config.timeout,
            self.inner.retry.retry(provider_id, &config.retry, attempt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::Timeout(config.timeout)),
        }
    }

    /// Start `provider_id` over with a fresh `Unknown` streak
    ///
    /// Used after a reconnect so the new connection earns its status through
    /// the thresholds again. Check counters and timestamps are kept.
    pub async fn reset_health(&self, provider_id: &str) -> bool {
        let health = {
            let mut providers = self.inner.providers.lock().await;
            let Some(entry) = providers.get_mut(provider_id) else {
                return false;
            };
            let health = &mut entry.health;
            health.status = HealthStatus::Unknown;
            health.consecutive_failures = 0;
            health.consecutive_successes = 0;
            health.last_error = None;
            health.clone()
        };
        debug!(provider = provider_id, "Health record reset");
        self.inner.events.emit(ResilienceEvent::HealthUpdated {
            provider_id: provider_id.to_string(),
            health,
        });
        true
    }

    /// Snapshot of one provider's health
    pub async fn health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.inner
            .providers
            .lock()
            .await
            .get(provider_id)
            .map(|entry| entry.health.clone())
    }

    /// Snapshots of every registered provider's health
    pub async fn all_health(&self) -> BTreeMap<String, ProviderHealth> {
        self.inner
            .providers
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.health.clone()))
            .collect()
    }

    pub async fn is_monitoring(&self, provider_id: &str) -> bool {
        self.inner
            .providers
            .lock()
            .await
            .get(provider_id)
            .is_some_and(|entry| entry.task.is_some())
    }

    /// Stop every probe loop and forget all providers
    pub async fn dispose(&self) {
        let drained: Vec<MonitoredProvider> = self
            .inner
            .providers
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        self.inner.retry.cancel_all().await;
    }
}
