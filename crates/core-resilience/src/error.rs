//! Error taxonomy shared by every resilience primitive

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable classification of a [`ResilienceError`]
///
/// This is the vocabulary exposed to telemetry: the metrics error histogram is
/// keyed by [`ErrorKind::as_str`] for every typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionFailed,
    InvalidEndpoint,
    ModelNotFound,
    HealthCheckFailed,
    AuthenticationFailed,
    Timeout,
    ProviderNotFound,
    InvalidConfiguration,
    NetworkError,
    RateLimitExceeded,
    PoolExhausted,
    PoolAcquireTimeout,
}

impl ErrorKind {
    /// Label used for histograms and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ErrorKind::InvalidEndpoint => "INVALID_ENDPOINT",
            ErrorKind::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorKind::HealthCheckFailed => "HEALTH_CHECK_FAILED",
            ErrorKind::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ProviderNotFound => "PROVIDER_NOT_FOUND",
            ErrorKind::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::PoolAcquireTimeout => "POOL_ACQUIRE_TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message fragments that mark a failure as transport-level
const TRANSPORT_MARKERS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "etimedout",
    "timed out",
    "timeout",
    "enotfound",
    "dns",
    "network error",
    "disconnect",
];

/// Errors produced by the resilience layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    #[error("Connection failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded for {provider_id}: waited {waited:?} for a token")]
    RateLimitTimeout {
        provider_id: String,
        waited: Duration,
    },

    #[error("Rate limit queue full for {provider_id} ({capacity} waiting)")]
    RateLimitQueueFull { provider_id: String, capacity: usize },

    #[error("Rate limiter cleared for {0}")]
    RateLimiterCleared(String),

    #[error("Connection pool exhausted for {provider_id} ({max_waiting} clients already waiting)")]
    PoolExhausted {
        provider_id: String,
        max_waiting: usize,
    },

    #[error("Timed out after {timeout:?} waiting for a pooled connection to {provider_id}")]
    PoolAcquireTimeout {
        provider_id: String,
        timeout: Duration,
    },

    #[error("Connection pool cleared for {0}")]
    PoolCleared(String),

    /// An error that did not originate in this taxonomy
    #[error("{message}")]
    Provider {
        type_name: &'static str,
        message: String,
    },
}

impl ResilienceError {
    /// Wrap a foreign error, remembering its concrete type name
    pub fn provider<E: std::error::Error>(err: E) -> Self {
        ResilienceError::Provider {
            type_name: short_type_name(std::any::type_name::<E>()),
            message: err.to_string(),
        }
    }

    /// Build an untyped error from a bare message
    pub fn message(message: impl Into<String>) -> Self {
        ResilienceError::Provider {
            type_name: "Error",
            message: message.into(),
        }
    }

    /// Taxonomy kind, or `None` for untyped provider errors
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ResilienceError::ConnectionFailed { .. } => Some(ErrorKind::ConnectionFailed),
            ResilienceError::InvalidEndpoint(_) => Some(ErrorKind::InvalidEndpoint),
            ResilienceError::ModelNotFound(_) => Some(ErrorKind::ModelNotFound),
            ResilienceError::HealthCheckFailed(_) => Some(ErrorKind::HealthCheckFailed),
            ResilienceError::AuthenticationFailed(_) => Some(ErrorKind::AuthenticationFailed),
            ResilienceError::Timeout(_) => Some(ErrorKind::Timeout),
            ResilienceError::ProviderNotFound(_) => Some(ErrorKind::ProviderNotFound),
            ResilienceError::InvalidConfiguration(_) => Some(ErrorKind::InvalidConfiguration),
            ResilienceError::Network(_) => Some(ErrorKind::NetworkError),
            ResilienceError::RateLimitTimeout { .. }
            | ResilienceError::RateLimitQueueFull { .. }
            | ResilienceError::RateLimiterCleared(_) => Some(ErrorKind::RateLimitExceeded),
            ResilienceError::PoolExhausted { .. } | ResilienceError::PoolCleared(_) => {
                Some(ErrorKind::PoolExhausted)
            }
            ResilienceError::PoolAcquireTimeout { .. } => Some(ErrorKind::PoolAcquireTimeout),
            ResilienceError::Provider { .. } => None,
        }
    }

    /// Histogram label: the taxonomy kind, or the source type name
    pub fn label(&self) -> &'static str {
        match self {
            ResilienceError::Provider { type_name, .. } => type_name,
            other => other.kind().map(|k| k.as_str()).unwrap_or("Error"),
        }
    }

    /// Whether the retry handler may try the operation again
    ///
    /// Connection, network and timeout failures are retryable. Any other typed
    /// error is final; untyped provider errors are retried.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            Some(ErrorKind::ConnectionFailed)
            | Some(ErrorKind::NetworkError)
            | Some(ErrorKind::Timeout) => true,
            Some(_) => false,
            None => true,
        }
    }

    /// Whether the failure looks like a broken transport worth reconnecting for
    pub fn is_transport_error(&self) -> bool {
        match self {
            ResilienceError::Network(_) | ResilienceError::Timeout(_) => true,
            other => {
                let msg = other.to_string().to_lowercase();
                TRANSPORT_MARKERS.iter().any(|marker| msg.contains(marker))
            }
        }
    }
}

/// `my_crate::module::FooError` -> `FooError`
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
