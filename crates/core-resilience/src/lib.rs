//! Tether Core Resilience: connection lifecycle primitives for LLM providers
//!
//! # Overview
//!
//! This crate provides the building blocks that keep a small set of logical
//! connections to remote inference providers alive, healthy and fairly shared
//! across concurrent callers. It includes:
//!
//! - **Retry Handler**: Exponential backoff with jitter, per-attempt timeouts and cancellation
//! - **Connection Pool**: Per-provider bounded pool with a FIFO wait queue and direct handoff
//! - **Rate Limiter**: Per-provider token bucket with a bounded, timed wait queue
//! - **Health Monitor**: Periodic probes classified with threshold hysteresis
//! - **Metrics Tracker**: Request counters, latency aggregates and rolling windows
//! - **Event Bus**: One broadcast channel carrying every notification
//!
//! # Key Principles
//!
//! This crate has no knowledge of:
//! - HTTP or any provider-specific payloads
//! - Configuration files or settings storage
//! - How connections are actually established
//!
//! Providers plug in through the [`Poolable`], [`ConnectionFactory`] and
//! [`HealthCheckable`] traits. All state is local, in-process and keyed by
//! provider id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Per-provider quotas
//! │  (Token bucket, FIFO wait queue)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Bounded concurrency
//! │  (max_size per provider, handoff)       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         LLM Provider
//!               │
//!      outcomes │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Metrics Tracker                   │  ← Counters, latency, windows
//! └─────────────────────────────────────────┘
//!
//!  Continuously running:
//!   Health Monitor → probe via Retry Handler → HealthUpdated / ProviderFailed
//!   Event Bus      → every notification, one channel
//! ```
//!
//! # Usage Example
//!
//! ## Retrying an operation
//!
//! ```no_run
//! use tether_core_resilience::{ResilienceError, RetryConfig, RetryHandler};
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let handler = RetryHandler::new();
//! let config = RetryConfig::default();
//!
//! let models = handler
//!     .retry("ollama", &config, || async {
//!         // Your potentially failing call
//!         Ok::<_, ResilienceError>(vec!["llama3".to_string()])
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Rate limiting
//!
//! ```no_run
//! use tether_core_resilience::{RateLimitConfig, RateLimiter, ResilienceError};
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire_token("ollama").await?;
//! // Send the request...
//! # Ok(())
//! # }
//! ```

pub mod connection_pool;
pub mod error;
pub mod events;
pub mod health_monitor;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;
pub mod state;

// Re-export main types for convenience
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, Poolable, PooledConnection,
};
pub use error::{ErrorKind, ResilienceError};
pub use events::{EventBus, EventReceiver, ResilienceEvent};
pub use health_monitor::{
    HealthCheckConfig, HealthCheckable, HealthMonitor, HealthStatus, ProbeOutcome, ProviderHealth,
};
pub use metrics::{ConnectionMetrics, MetricsTracker};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{RetryConfig, RetryHandler, RetryState};
pub use state::{
    ConnectionEventData, ConnectionState, ConnectionStatus, HealthCheckResponse,
    HealthCheckStatus,
};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tether_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, Poolable};
    pub use super::error::{ErrorKind, ResilienceError};
    pub use super::events::{EventBus, ResilienceEvent};
    pub use super::health_monitor::{HealthCheckConfig, HealthCheckable, HealthMonitor};
    pub use super::metrics::MetricsTracker;
    pub use super::rate_limiter::{RateLimitConfig, RateLimiter};
    pub use super::retry::{RetryConfig, RetryHandler};
    pub use super::state::{ConnectionState, ConnectionStatus, HealthCheckResponse};
}
