/*!
 * Configuration types for Tether
 *
 * The file carries a `[defaults]` block with the four resilience sections and a
 * `[providers.<id>]` table per provider. A provider table may override any
 * subset of fields; its effective settings are the defaults deep-merged with
 * that table, field by field, provider wins.
 *
 * ```toml
 * [logging]
 * log_level = "debug"
 *
 * [defaults.retry]
 * max_attempts = 5
 *
 * [providers.ollama]
 * endpoint = "http://localhost:11434/api/tags"
 *
 * [providers.ollama.pool]
 * max_size = 2
 * ```
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core_resilience::{
    HealthCheckConfig, PoolConfig, RateLimitConfig, ResilienceError, RetryConfig,
};

use crate::error::{Result, TetherError};

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Settings every provider starts from
    #[serde(default)]
    pub defaults: ResilienceSettings,

    /// Per-provider entries keyed by provider id
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Logging options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// One provider's entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// URL probed by the generic HTTP provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Partial `retry`, `health`, `pool` and `rate_limit` tables
    #[serde(flatten)]
    pub overrides: toml::Table,
}

/// The four resilience sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceSettings {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Per-attempt timeout; 0 disables it
    #[serde(default = "default_retry_timeout_ms")]
    pub timeout_ms: u64,
    /// Proportional jitter in `[0, 1]`
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            timeout_ms: default_retry_timeout_ms(),
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Attempts per probe, using the retry section's backoff
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            max_consecutive_failures: default_max_consecutive_failures(),
            probe_attempts: default_probe_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// 0 keeps idle connections forever
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_waiting_clients")]
    pub max_waiting_clients: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            min_size: default_pool_min_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_waiting_clients: default_max_waiting_clients(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

// Default value functions for serde
fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retry_timeout_ms() -> u64 {
    30_000
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5000
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_probe_attempts() -> u32 {
    1
}

fn default_pool_max_size() -> usize {
    5
}

fn default_pool_min_size() -> usize {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_waiting_clients() -> usize {
    10
}

/// Slowest accepted refill rate
const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst_size() -> u32 {
    20
}

fn default_max_queue_size() -> usize {
    100
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn invalid(message: impl Into<String>) -> ResilienceError {
    ResilienceError::InvalidConfiguration(message.into())
}

impl ResilienceSettings {
    /// Reject settings the core cannot run with
    pub fn validate(&self) -> std::result::Result<(), ResilienceError> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(invalid("retry.jitter must be within [0, 1]"));
        }

        let health = &self.health;
        if health.healthy_threshold == 0 || health.unhealthy_threshold == 0 {
            return Err(invalid("health thresholds must be at least 1"));
        }
        if health.max_consecutive_failures < health.unhealthy_threshold {
            return Err(invalid(
                "health.max_consecutive_failures must be >= health.unhealthy_threshold",
            ));
        }
        if health.check_interval_ms == 0 {
            return Err(invalid("health.check_interval_ms must be > 0"));
        }
        if health.probe_attempts == 0 {
            return Err(invalid("health.probe_attempts must be at least 1"));
        }

        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(invalid("pool.max_size must be > 0"));
        }
        if pool.min_size > pool.max_size {
            return Err(invalid("pool.min_size must not exceed pool.max_size"));
        }

        let rate = &self.rate_limit;
        if !rate.requests_per_second.is_finite()
            || rate.requests_per_second < MIN_REQUESTS_PER_SECOND
        {
            return Err(invalid(format!(
                "rate_limit.requests_per_second must be finite and >= {}",
                MIN_REQUESTS_PER_SECOND
            )));
        }
        if rate.burst_size == 0 {
            return Err(invalid("rate_limit.burst_size must be > 0"));
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        let r = &self.retry;
        RetryConfig {
            max_attempts: r.max_attempts,
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
            backoff_factor: r.backoff_factor,
            timeout: (r.timeout_ms > 0).then(|| Duration::from_millis(r.timeout_ms)),
            jitter: r.jitter,
        }
    }

    pub fn health_config(&self) -> HealthCheckConfig {
        let h = &self.health;
        HealthCheckConfig {
            check_interval: Duration::from_millis(h.check_interval_ms),
            timeout: Duration::from_millis(h.timeout_ms),
            healthy_threshold: h.healthy_threshold,
            unhealthy_threshold: h.unhealthy_threshold,
            max_consecutive_failures: h.max_consecutive_failures,
            retry: RetryConfig {
                max_attempts: h.probe_attempts,
                ..self.retry_config()
            },
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let p = &self.pool;
        PoolConfig {
            max_size: p.max_size,
            min_size: p.min_size,
            acquire_timeout: Duration::from_millis(p.acquire_timeout_ms),
            idle_timeout: (p.idle_timeout_ms > 0).then(|| Duration::from_millis(p.idle_timeout_ms)),
            max_waiting_clients: p.max_waiting_clients,
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let r = &self.rate_limit;
        RateLimitConfig {
            requests_per_second: r.requests_per_second,
            burst_size: r.burst_size,
            max_queue_size: r.max_queue_size,
            queue_timeout: Duration::from_millis(r.queue_timeout_ms),
        }
    }
}

/// A provider's effective settings after merging
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProvider {
    pub id: String,
    pub endpoint: Option<String>,
    pub settings: ResilienceSettings,
}

impl TetherConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Effective settings for `provider_id`
    pub fn resolve(&self, provider_id: &str) -> Result<ResolvedProvider> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| ResilienceError::ProviderNotFound(provider_id.to_string()))?;

        let mut merged = toml::Value::try_from(&self.defaults)?;
        deep_merge(&mut merged, &toml::Value::Table(provider.overrides.clone()));
        let settings: ResilienceSettings = merged.try_into().map_err(|e: toml::de::Error| {
            TetherError::Config(format!("provider '{}': {}", provider_id, e.message()))
        })?;

        Ok(ResolvedProvider {
            id: provider_id.to_string(),
            endpoint: provider.endpoint.clone(),
            settings,
        })
    }

    /// Every provider, resolved, in id order
    pub fn resolve_all(&self) -> Result<Vec<ResolvedProvider>> {
        self.providers.keys().map(|id| self.resolve(id)).collect()
    }

    /// Validate the defaults and every provider's effective settings
    pub fn validate(&self) -> Result<()> {
        self.defaults
            .validate()
            .map_err(|e| TetherError::Config(format!("defaults: {}", e)))?;

        for resolved in self.resolve_all()? {
            resolved
                .settings
                .validate()
                .map_err(|e| TetherError::Config(format!("provider '{}': {}", resolved.id, e)))?;
            if let Some(endpoint) = &resolved.endpoint {
                reqwest::Url::parse(endpoint).map_err(|e| {
                    ResilienceError::InvalidEndpoint(format!("{} ({})", endpoint, e))
                })?;
            }
        }
        Ok(())
    }
}

/// Overlay `overlay` onto `base`; tables merge recursively, anything else is replaced
fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
