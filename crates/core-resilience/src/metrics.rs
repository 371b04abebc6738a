//! Per-provider request metrics with rolling windows
//!
//! Cumulative counters are kept alongside a bounded list of recent samples.
//! Samples older than an hour are pruned on every mutation, on every read and
//! by the optional background sweeper; the per-minute and per-hour request
//! counts are recomputed from what remains.

use crate::error::ResilienceError;
use crate::events::{EventBus, ResilienceEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Upper bound on retained samples per provider
pub const MAX_SAMPLES: usize = 10_000;

/// Snapshot of a provider's request metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub connections_established: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
    /// `None` until the first successful request
    pub min_latency: Option<Duration>,
    pub average_latency: Duration,
    /// Failure histogram keyed by error label
    pub errors: BTreeMap<String, u64>,
    pub requests_in_last_minute: usize,
    pub requests_in_last_hour: usize,
    /// Mean latency of successful requests still inside the hour window
    pub recent_average_latency: Duration,
    pub last_request_time: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    /// Fraction of requests that succeeded (1.0 when nothing was recorded)
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    /// `None` for failed requests
    duration: Option<Duration>,
}

#[derive(Debug, Default)]
struct ProviderMetrics {
    metrics: ConnectionMetrics,
    samples: VecDeque<Sample>,
}

impl ProviderMetrics {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > HOUR {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    fn push_sample(&mut self, now: Instant, duration: Option<Duration>) {
        self.samples.push_back(Sample { at: now, duration });
        self.prune(now);
    }

    fn snapshot(&mut self, now: Instant) -> ConnectionMetrics {
        self.prune(now);
        let mut snapshot = self.metrics.clone();
        snapshot.requests_in_last_hour = self.samples.len();
        snapshot.requests_in_last_minute = self
            .samples
            .iter()
            .rev()
            .take_while(|s| now.duration_since(s.at) <= MINUTE)
            .count();

        let (sum, count) = self
            .samples
            .iter()
            .filter_map(|s| s.duration)
            .fold((Duration::ZERO, 0u64), |(sum, n), d| (sum + d, n + 1));
        snapshot.recent_average_latency = mean(sum, count);
        snapshot
    }
}

/// `total / count` in nanoseconds; zero when nothing was counted
fn mean(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Records connection and request outcomes per provider
pub struct MetricsTracker {
    providers: Mutex<HashMap<String, ProviderMetrics>>,
    events: Option<EventBus>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            events: None,
            sweeper: Mutex::new(None),
        }
    }

    /// Emit `metricsUpdated` after every mutation
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Record a successfully established connection
    pub async fn record_connection_success(&self, provider_id: &str) {
        self.update(provider_id, |entry, _now| {
            entry.metrics.connections_established += 1;
        })
        .await;
    }

    /// Record a successful request and its latency
    pub async fn record_request(&self, provider_id: &str, duration: Duration) {
        self.update(provider_id, |entry, now| {
            let m = &mut entry.metrics;
            m.total_requests += 1;
            m.successful_requests += 1;
            m.total_latency += duration;
            m.max_latency = m.max_latency.max(duration);
            m.min_latency = Some(m.min_latency.map_or(duration, |min| min.min(duration)));
            m.average_latency = mean(m.total_latency, m.successful_requests);
            m.last_request_time = Some(Utc::now());
            entry.push_sample(now, Some(duration));
        })
        .await;
    }

    /// Record a failed request
    pub async fn record_failure(&self, provider_id: &str, error: &ResilienceError) {
        let label = error.label().to_string();
        self.update(provider_id, |entry, now| {
            let m = &mut entry.metrics;
            m.total_requests += 1;
            m.failed_requests += 1;
            *m.errors.entry(label).or_insert(0) += 1;
            m.last_request_time = Some(Utc::now());
            entry.push_sample(now, None);
        })
        .await;
    }

    async fn update<F>(&self, provider_id: &str, mutate: F)
    where
        F: FnOnce(&mut ProviderMetrics, Instant),
    {
        let now = Instant::now();
        let snapshot = {
            let mut providers = self.providers.lock().await;
            let entry = providers.entry(provider_id.to_string()).or_default();
            mutate(entry, now);
            entry.snapshot(now)
        };

        if let Some(events) = &self.events {
            events.emit(ResilienceEvent::MetricsUpdated {
                provider_id: provider_id.to_string(),
                metrics: snapshot,
            });
        }
    }

    /// Snapshot for one provider; unknown providers start out empty
    pub async fn metrics(&self, provider_id: &str) -> ConnectionMetrics {
        let mut providers = self.providers.lock().await;
        providers
            .entry(provider_id.to_string())
            .or_default()
            .snapshot(Instant::now())
    }

    /// Snapshots for every tracked provider
    pub async fn snapshot_all(&self) -> BTreeMap<String, ConnectionMetrics> {
        let now = Instant::now();
        let mut providers = self.providers.lock().await;
        providers
            .iter_mut()
            .map(|(id, entry)| (id.clone(), entry.snapshot(now)))
            .collect()
    }

    /// Zero one provider's counters and samples
    pub async fn reset(&self, provider_id: &str) {
        let mut providers = self.providers.lock().await;
        if let Some(entry) = providers.get_mut(provider_id) {
            *entry = ProviderMetrics::default();
        }
    }

    /// Zero every provider's counters and samples
    pub async fn reset_all(&self) {
        let mut providers = self.providers.lock().await;
        for entry in providers.values_mut() {
            *entry = ProviderMetrics::default();
        }
    }

    /// Forget a provider entirely
    pub async fn remove(&self, provider_id: &str) -> bool {
        self.providers.lock().await.remove(provider_id).is_some()
    }

    /// Prune stale samples for every provider
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut providers = self.providers.lock().await;
        for entry in providers.values_mut() {
            entry.prune(now);
        }
    }

    /// Start the periodic sweep, replacing any running sweeper
    pub async fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(tracker) = weak.upgrade() else {
                    break;
                };
                tracker.sweep().await;
            }
        });

        let mut slot = self.sweeper.lock().await;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        debug!(every_ms = every.as_millis() as u64, "Metrics sweeper started");
    }

    pub async fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_handles_counts_beyond_u32() {
        let count = u64::from(u32::MAX) + 1;
        let total = Duration::from_nanos(3 * count);
        assert_eq!(mean(total, count), Duration::from_nanos(3));
        assert_eq!(mean(Duration::from_secs(1), 0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_latency_aggregates() {
        let tracker = MetricsTracker::new();
        for ms in [10, 20, 30] {
            tracker
                .record_request("ollama", Duration::from_millis(ms))
                .await;
        }

        let m = tracker.metrics("ollama").await;
        assert_eq!(m.successful_requests, 3);
        assert_eq!(m.total_requests, 3);
        assert_eq!(m.average_latency, Duration::from_millis(20));
        assert_eq!(m.max_latency, Duration::from_millis(30));
        assert_eq!(m.min_latency, Some(Duration::from_millis(10)));
        assert_eq!(m.recent_average_latency, Duration::from_millis(20));
        assert_eq!(m.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_error_histogram_labels() {
        let tracker = MetricsTracker::new();
        tracker
            .record_failure("p", &ResilienceError::Timeout(Duration::from_secs(1)))
            .await;
        tracker
            .record_failure("p", &ResilienceError::Timeout(Duration::from_secs(2)))
            .await;
        tracker
            .record_failure("p", &ResilienceError::message("boom"))
            .await;

        let m = tracker.metrics("p").await;
        assert_eq!(m.failed_requests, 3);
        assert_eq!(m.errors.get("TIMEOUT"), Some(&2));
        assert_eq!(m.errors.get("Error"), Some(&1));
        assert_eq!(m.success_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_windows_prune() {
        let tracker = MetricsTracker::new();
        tracker.record_request("p", Duration::from_millis(5)).await;

        tokio::time::advance(Duration::from_secs(90)).await;
        tracker.record_request("p", Duration::from_millis(5)).await;

        let m = tracker.metrics("p").await;
        assert_eq!(m.requests_in_last_minute, 1);
        assert_eq!(m.requests_in_last_hour, 2);

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        let m = tracker.metrics("p").await;
        assert_eq!(m.requests_in_last_hour, 0);
        // Cumulative counters survive pruning
        assert_eq!(m.successful_requests, 2);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let tracker = MetricsTracker::new();
        tracker.record_connection_success("p").await;
        tracker.record_request("p", Duration::from_millis(7)).await;
        tracker.reset("p").await;

        let m = tracker.metrics("p").await;
        assert_eq!(m, ConnectionMetrics::default());
    }

    #[tokio::test]
    async fn test_metrics_updated_event() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let tracker = MetricsTracker::new().with_events(events);

        tracker.record_request("p", Duration::from_millis(3)).await;
        match rx.recv().await.unwrap() {
            ResilienceEvent::MetricsUpdated {
                provider_id,
                metrics,
            } => {
                assert_eq!(provider_id, "p");
                assert_eq!(metrics.successful_requests, 1);
                assert_eq!(metrics.requests_in_last_minute, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_prunes_in_background() {
        let tracker = Arc::new(MetricsTracker::new());
        tracker.record_request("p", Duration::from_millis(1)).await;
        tracker.start_sweeper(Duration::from_secs(30)).await;

        tokio::time::sleep(Duration::from_secs(60 * 60 + 60)).await;
        {
            let providers = tracker.providers.lock().await;
            assert!(providers["p"].samples.is_empty());
        }
        tracker.stop_sweeper().await;
    }
}
