//! Notification bus for connection, health, metrics and retry events
//!
//! Every subsystem emits onto one broadcast channel with a closed event
//! vocabulary. Observers subscribe to the bus instead of holding references to
//! the emitting components, so the manager, monitor and pool never need to know
//! about each other.

use crate::health_monitor::ProviderHealth;
use crate::metrics::ConnectionMetrics;
use crate::state::{ConnectionEventData, ConnectionStatus};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity; slow receivers observe `Lagged` instead of blocking emitters
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Every notification the resilience layer can emit
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    Connected {
        provider_id: String,
    },
    Disconnected {
        provider_id: String,
    },
    Reconnecting {
        provider_id: String,
        attempt: u32,
        delay: Duration,
    },
    Error {
        provider_id: String,
        message: String,
    },
    StateChanged(ConnectionEventData),
    ModelChanged {
        provider_id: String,
        status: ConnectionStatus,
    },
    HealthCheckFailed {
        provider_id: String,
        message: String,
    },
    HealthUpdated {
        provider_id: String,
        health: ProviderHealth,
    },
    ProviderFailed {
        provider_id: String,
        error: String,
        health: ProviderHealth,
    },
    MetricsUpdated {
        provider_id: String,
        metrics: ConnectionMetrics,
    },
    Retrying {
        provider_id: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
}

impl ResilienceEvent {
    /// Provider the event concerns
    pub fn provider_id(&self) -> &str {
        match self {
            ResilienceEvent::Connected { provider_id }
            | ResilienceEvent::Disconnected { provider_id }
            | ResilienceEvent::Reconnecting { provider_id, .. }
            | ResilienceEvent::Error { provider_id, .. }
            | ResilienceEvent::ModelChanged { provider_id, .. }
            | ResilienceEvent::HealthCheckFailed { provider_id, .. }
            | ResilienceEvent::HealthUpdated { provider_id, .. }
            | ResilienceEvent::ProviderFailed { provider_id, .. }
            | ResilienceEvent::MetricsUpdated { provider_id, .. }
            | ResilienceEvent::Retrying { provider_id, .. } => provider_id,
            ResilienceEvent::StateChanged(data) => &data.provider_id,
        }
    }

    /// Short event name for log lines
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::Connected { .. } => "connected",
            ResilienceEvent::Disconnected { .. } => "disconnected",
            ResilienceEvent::Reconnecting { .. } => "reconnecting",
            ResilienceEvent::Error { .. } => "error",
            ResilienceEvent::StateChanged(_) => "state_changed",
            ResilienceEvent::ModelChanged { .. } => "model_changed",
            ResilienceEvent::HealthCheckFailed { .. } => "health_check_failed",
            ResilienceEvent::HealthUpdated { .. } => "health_updated",
            ResilienceEvent::ProviderFailed { .. } => "provider_failed",
            ResilienceEvent::MetricsUpdated { .. } => "metrics_updated",
            ResilienceEvent::Retrying { .. } => "retrying",
        }
    }
}

pub type EventReceiver = broadcast::Receiver<ResilienceEvent>;

/// Cloneable handle onto the shared notification channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every event emitted after this call
    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ResilienceEvent) {
        trace!(event = event.name(), provider = event.provider_id(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
