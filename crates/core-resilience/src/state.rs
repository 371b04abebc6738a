//! Connection state and status records shared between the state machine and its observers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a provider connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection; the initial state
    #[default]
    Disconnected,
    /// `connect()` is running its attempt loop
    Connecting,
    /// Connection established and health checks running
    Connected,
    /// Last operation failed; terminal until an explicit `connect()` unless a reconnect is underway
    Error,
    /// Automatic reconnect in progress after a transport failure
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Externally visible status of a provider connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the transport is up
    pub connected: bool,
    /// Whether the provider is accepting requests
    pub available: bool,
    /// Last error message, cleared on successful connect
    pub error: Option<String>,
    /// Wall-clock time of the last successful health check
    pub last_checked: Option<DateTime<Utc>>,
    /// Models advertised by the provider's health checks
    pub models: Vec<String>,
    /// Free-form provider metadata, merged non-destructively
    pub metadata: BTreeMap<String, String>,
}

impl ConnectionStatus {
    /// Merge models and metadata from a health response without dropping existing keys.
    ///
    /// Returns `true` when the advertised model list changed.
    pub fn merge_response(&mut self, response: &HealthCheckResponse) -> bool {
        let mut changed = false;
        if let Some(models) = &response.models {
            for model in models {
                if !self.models.contains(model) {
                    self.models.push(model.clone());
                    changed = true;
                }
            }
        }
        for (key, value) in &response.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        changed
    }
}

/// Payload of a `stateChanged` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEventData {
    pub provider_id: String,
    pub state: ConnectionState,
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

/// Outcome reported by a provider's own health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckStatus {
    Ok,
    Error,
}

/// Response of a single provider health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthCheckStatus,
    pub message: Option<String>,
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl HealthCheckResponse {
    pub fn ok() -> Self {
        Self {
            status: HealthCheckStatus::Ok,
            message: None,
            models: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthCheckStatus::Error,
            message: Some(message.into()),
            models: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthCheckStatus::Ok
    }
}
