//! Token-bucket admission control per provider
//!
//! Each provider owns a bucket of at most `burst_size` tokens that refills at
//! `requests_per_second`. Refill is computed lazily whenever the bucket is
//! touched, and refill-then-take is one step under the limiter lock. Callers
//! that find the bucket empty wait in a bounded FIFO queue which a per-provider
//! drain task services as tokens accrue.
//!
//! # Example
//!
//! ```no_run
//! use tether_core_resilience::{RateLimiter, RateLimitConfig, ResilienceError};
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//!
//! // Waits in the queue if the bucket is empty
//! limiter.acquire_token("ollama").await?;
//!
//! // Never waits
//! let admitted = limiter.try_acquire_token("ollama").await;
//! # Ok(())
//! # }
//! ```

use crate::error::ResilienceError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Smallest pause of the drain loop, so a tiny deficit cannot spin
const MIN_DRAIN_PAUSE: Duration = Duration::from_millis(1);

/// Configuration for one provider's bucket
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst_size: u32,
    /// Maximum callers allowed to wait for a token
    pub max_queue_size: usize,
    /// How long a queued caller waits before failing
    pub queue_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 20,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

/// Token bucket state; `0 <= tokens <= burst_size` always holds
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.burst_size),
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = f64::from(config.burst_size);
        let rate = config.requests_per_second;
        let added = if rate.is_nan() || rate <= 0.0 {
            0.0
        } else if rate.is_infinite() {
            capacity
        } else {
            elapsed * rate
        };
        self.tokens = (self.tokens + added).clamp(0.0, capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn give_back(&mut self, config: &RateLimitConfig) {
        self.tokens = (self.tokens + 1.0).min(f64::from(config.burst_size));
    }

    fn time_until_token(&self, config: &RateLimitConfig) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        let rate = config.requests_per_second;
        if rate.is_nan() || rate <= 0.0 {
            return config.queue_timeout.max(MIN_DRAIN_PAUSE);
        }
        // Very slow rates overflow Duration
        Duration::try_from_secs_f64(deficit / rate)
            .unwrap_or(config.queue_timeout)
            .min(config.queue_timeout)
            .max(MIN_DRAIN_PAUSE)
    }

    fn tokens(&self) -> f64 {
        self.tokens
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<(), ResilienceError>>,
}

struct ProviderLimiter {
    config: RateLimitConfig,
    bucket: TokenBucket,
    queue: VecDeque<Waiter>,
    drainer: Option<JoinHandle<()>>,
}

impl ProviderLimiter {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::full(&config, now),
            config,
            queue: VecDeque::new(),
            drainer: None,
        }
    }

    /// Hand tokens to queued callers, oldest first, while tokens remain
    fn service_queue(&mut self, now: Instant) {
        self.bucket.refill(&self.config, now);
        while self.bucket.tokens >= 1.0 {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            self.bucket.tokens -= 1.0;
            if waiter.tx.send(Ok(())).is_err() {
                self.bucket.give_back(&self.config);
            }
        }
    }

    fn reject_all(&mut self, provider_id: &str) {
        for waiter in self.queue.drain(..) {
            let _ = waiter
                .tx
                .send(Err(ResilienceError::RateLimiterCleared(provider_id.to_string())));
        }
        if let Some(drainer) = self.drainer.take() {
            drainer.abort();
        }
    }
}

struct Inner {
    default_config: RateLimitConfig,
    overrides: Mutex<HashMap<String, RateLimitConfig>>,
    providers: Mutex<HashMap<String, ProviderLimiter>>,
    next_id: AtomicU64,
}

/// Per-provider token-bucket rate limiter with a bounded FIFO wait queue
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_config,
                overrides: Mutex::new(HashMap::new()),
                providers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Use `config` for `provider_id` instead of the default
    ///
    /// An existing bucket keeps its tokens, clamped to the new capacity.
    pub async fn set_config(&self, provider_id: &str, config: RateLimitConfig) {
        self.inner
            .overrides
            .lock()
            .await
            .insert(provider_id.to_string(), config.clone());

        let mut providers = self.inner.providers.lock().await;
        if let Some(limiter) = providers.get_mut(provider_id) {
            let now = Instant::now();
            limiter.bucket.refill(&limiter.config, now);
            limiter.bucket.tokens = limiter.bucket.tokens.min(f64::from(config.burst_size));
            limiter.config = config;
        }
    }

    /// Effective configuration for `provider_id`
    pub async fn config_for(&self, provider_id: &str) -> RateLimitConfig {
        self.inner
            .overrides
            .lock()
            .await
            .get(provider_id)
            .cloned()
            .unwrap_or_else(|| self.inner.default_config.clone())
    }

    /// Take one token, waiting in the provider's queue if none is available.
    ///
    /// Fails immediately with `RateLimitQueueFull` when the queue is at
    /// capacity, and with `RateLimitTimeout` when the wait exceeds the
    /// configured queue timeout.
    pub async fn acquire_token(&self, provider_id: &str) -> Result<(), ResilienceError> {
        let config = self.config_for(provider_id).await;

        let (mut rx, id, queue_timeout) = {
            let mut providers = self.inner.providers.lock().await;
            let now = Instant::now();
            let limiter = providers
                .entry(provider_id.to_string())
                .or_insert_with(|| ProviderLimiter::new(config, now));

            limiter.bucket.refill(&limiter.config, now);
            if limiter.queue.is_empty() && limiter.bucket.try_take() {
                return Ok(());
            }

            if limiter.queue.len() >= limiter.config.max_queue_size {
                warn!(
                    provider = provider_id,
                    queued = limiter.queue.len(),
                    "Rate limit queue full"
                );
                return Err(ResilienceError::RateLimitQueueFull {
                    provider_id: provider_id.to_string(),
                    capacity: limiter.config.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            limiter.queue.push_back(Waiter { id, tx });
            debug!(
                provider = provider_id,
                position = limiter.queue.len(),
                "Queued for rate limit token"
            );
            self.ensure_drainer(limiter, provider_id);
            (rx, id, limiter.config.queue_timeout)
        };

        match tokio::time::timeout(queue_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResilienceError::RateLimiterCleared(provider_id.to_string())),
            Err(_) => {
                let mut providers = self.inner.providers.lock().await;
                let still_queued = providers
                    .get_mut(provider_id)
                    .map(|limiter| {
                        let before = limiter.queue.len();
                        limiter.queue.retain(|w| w.id != id);
                        before != limiter.queue.len()
                    })
                    .unwrap_or(false);

                if still_queued {
                    return Err(ResilienceError::RateLimitTimeout {
                        provider_id: provider_id.to_string(),
                        waited: queue_timeout,
                    });
                }

                // Serviced concurrently with the deadline; honour what was sent
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(ResilienceError::RateLimitTimeout {
                        provider_id: provider_id.to_string(),
                        waited: queue_timeout,
                    }),
                }
            }
        }
    }

    /// Take one token if available right now; never queues.
    ///
    /// Returns `false` while other callers are queued so they keep their turn.
    pub async fn try_acquire_token(&self, provider_id: &str) -> bool {
        let config = self.config_for(provider_id).await;
        let mut providers = self.inner.providers.lock().await;
        let now = Instant::now();
        let limiter = providers
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderLimiter::new(config, now));

        limiter.bucket.refill(&limiter.config, now);
        limiter.queue.is_empty() && limiter.bucket.try_take()
    }

    /// Return an unused token and service the queue
    pub async fn release_token(&self, provider_id: &str) {
        let mut providers = self.inner.providers.lock().await;
        if let Some(limiter) = providers.get_mut(provider_id) {
            let now = Instant::now();
            limiter.bucket.refill(&limiter.config, now);
            limiter.bucket.give_back(&limiter.config);
            limiter.service_queue(now);
        }
    }

    /// Current token count after refill
    pub async fn available_tokens(&self, provider_id: &str) -> f64 {
        let config = self.config_for(provider_id).await;
        let mut providers = self.inner.providers.lock().await;
        let now = Instant::now();
        let limiter = providers
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderLimiter::new(config, now));
        limiter.bucket.refill(&limiter.config, now);
        limiter.bucket.tokens()
    }

    /// Number of callers waiting for a token
    pub async fn queue_len(&self, provider_id: &str) -> usize {
        self.inner
            .providers
            .lock()
            .await
            .get(provider_id)
            .map_or(0, |limiter| limiter.queue.len())
    }

    /// Reject every waiter for `provider_id` and drop its bucket
    pub async fn clear(&self, provider_id: &str) {
        let removed = self.inner.providers.lock().await.remove(provider_id);
        if let Some(mut limiter) = removed {
            debug!(
                provider = provider_id,
                waiters = limiter.queue.len(),
                "Clearing rate limiter"
            );
            limiter.reject_all(provider_id);
        }
        self.inner.overrides.lock().await.remove(provider_id);
    }

    /// Reject every waiter for every provider and drop all buckets
    pub async fn dispose(&self) {
        let drained: Vec<(String, ProviderLimiter)> =
            self.inner.providers.lock().await.drain().collect();
        for (provider_id, mut limiter) in drained {
            limiter.reject_all(&provider_id);
        }
        self.inner.overrides.lock().await.clear();
    }

    /// Spawn the provider's drain task unless one is already running
    fn ensure_drainer(&self, limiter: &mut ProviderLimiter, provider_id: &str) {
        if limiter
            .drainer
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let provider_id = provider_id.to_string();
        limiter.drainer = Some(tokio::spawn(async move {
            loop {
                let pause = {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let mut providers = inner.providers.lock().await;
                    let Some(limiter) = providers.get_mut(&provider_id) else {
                        break;
                    };
                    limiter.service_queue(Instant::now());
                    if limiter.queue.is_empty() {
                        limiter.drainer = None;
                        break;
                    }
                    limiter.bucket.time_until_token(&limiter.config)
                };
                tokio::time::sleep(pause).await;
            }
        }));
    }
}
