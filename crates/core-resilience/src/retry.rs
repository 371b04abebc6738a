//! Exponential-backoff retry executor
//!
//! Retries are keyed (usually by provider id). At most one retry delay may be
//! pending per key: scheduling a new one cancels the previous timer, and the
//! superseded caller resolves with the error it was about to retry instead of
//! hanging.

use crate::error::ResilienceError;
use crate::events::{EventBus, ResilienceEvent};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of calls allowed, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap applied to every computed delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Per-call timeout; `None` lets a call run as long as it likes
    pub timeout: Option<Duration>,
    /// Proportional jitter in `[0, 1]`, applied by [`RetryHandler`] only
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            timeout: Some(Duration::from_millis(30_000)),
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// `min(base_delay * backoff_factor^attempt, max_delay)`, without jitter
    ///
    /// # Example
    ///
    /// ```
    /// use tether_core_resilience::retry::RetryConfig;
    /// use std::time::Duration;
    ///
    /// let config = RetryConfig::default();
    /// assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
    /// assert_eq!(config.delay_for_attempt(5), Duration::from_millis(30_000));
    /// ```
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.powi(attempt);
        let delay_ms = self.base_delay.as_millis() as f64 * factor;
        let max_ms = self.max_delay.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms.round() as u64)
        }
    }

    /// Whether another call is allowed after `completed_retries` retries
    pub fn has_attempts_left(&self, completed_retries: u32) -> bool {
        completed_retries.saturating_add(1) < self.max_attempts
    }
}

/// Attempt counter owned by whoever runs a retry loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub current_attempt: u32,
}

impl RetryState {
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

struct PendingRetry {
    id: u64,
    cancel: oneshot::Sender<()>,
}

/// Keyed retry executor with exponential backoff
pub struct RetryHandler {
    pending: Mutex<HashMap<String, PendingRetry>>,
    next_id: AtomicU64,
    events: Option<EventBus>,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryHandler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events: None,
        }
    }

    /// Emit `retrying` notifications onto `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Run `op` with a fresh attempt counter
    pub async fn retry<F, Fut, T>(
        &self,
        key: &str,
        config: &RetryConfig,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let mut state = RetryState::default();
        self.retry_with_state(key, config, &mut state, op).await
    }

    /// Run `op`, retrying retryable failures while attempts remain.
    ///
    /// `state.current_attempt` is reset to 0 on success. Non-retryable errors
    /// and the final failure are returned unchanged.
    pub async fn retry_with_state<F, Fut, T>(
        &self,
        key: &str,
        config: &RetryConfig,
        state: &mut RetryState,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        loop {
            let result = match config.timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(ResilienceError::Timeout(limit)),
                },
                None => op().await,
            };

            let err = match result {
                Ok(value) => {
                    state.reset();
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || !config.has_attempts_left(state.current_attempt) {
                debug!(key, attempts = state.current_attempt + 1, error = %err, "Giving up");
                return Err(err);
            }

            let delay = apply_jitter(config, config.delay_for_attempt(state.current_attempt));
            state.current_attempt += 1;

            warn!(
                key,
                attempt = state.current_attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            if let Some(events) = &self.events {
                events.emit(ResilienceEvent::Retrying {
                    provider_id: key.to_string(),
                    attempt: state.current_attempt,
                    delay,
                    error: err.to_string(),
                });
            }

            if !self.wait(key, delay).await {
                debug!(key, "Pending retry superseded or cancelled");
                return Err(err);
            }
        }
    }

    /// Sleep for `delay` unless superseded; returns `false` when cancelled
    async fn wait(&self, key: &str, delay: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.pending.lock().await;
            // Dropping the previous sender wakes its waiter as cancelled
            pending.insert(key.to_string(), PendingRetry { id, cancel: tx });
        }

        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = rx => false,
        };

        let mut pending = self.pending.lock().await;
        if pending.get(key).map(|p| p.id) == Some(id) {
            pending.remove(key);
        }

        completed
    }

    /// Cancel the pending retry for `key`, if any
    pub async fn cancel(&self, key: &str) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.remove(key) {
            Some(entry) => {
                let _ = entry.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Cancel every pending retry
    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.cancel.send(());
        }
    }

    /// Number of keys with a retry delay currently pending
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn apply_jitter(config: &RetryConfig, delay: Duration) -> Duration {
    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter <= 0.0 {
        return delay;
    }

    let base_ms = delay.as_millis() as f64;
    let spread = base_ms * jitter;
    let offset = rand::rng().random_range(-spread..=spread);
    let jittered = Duration::from_millis((base_ms + offset).max(0.0).round() as u64);
    jittered.min(config.max_delay)
}
