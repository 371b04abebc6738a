//! Connection lifecycle through the registry
//!
//! Drives the state machine and its health loop with a scripted provider on a
//! paused clock: connect retries, health failures below and beyond the
//! unhealthy threshold, transport recovery, model discovery and disconnect.

mod common;

use common::{fast_settings, MockConn, ScriptedProvider};
use std::sync::Arc;
use std::time::Duration;
use tether::ProviderRegistry;
use tether_core_resilience::{
    ConnectionState, EventReceiver, HealthCheckResponse, HealthStatus, ResilienceError,
    ResilienceEvent,
};
use tokio::time::Instant;

async fn registry_with(provider: Arc<ScriptedProvider>) -> ProviderRegistry<MockConn> {
    let settings = fast_settings();
    let registry = ProviderRegistry::new(&settings);
    registry.register("p", provider, &settings).await.unwrap();
    registry
}

fn event_names(rx: &mut EventReceiver) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    names
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_with_backoff() {
    let provider = Arc::new(ScriptedProvider::default());
    provider.push_establish(Err(ResilienceError::message("ECONNREFUSED")));
    let registry = registry_with(provider.clone()).await;

    let started = Instant::now();
    registry.connect("p").await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_millis(100));
    assert_eq!(provider.establish_calls(), 2);
    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_surfaces_last_error() {
    let provider = Arc::new(ScriptedProvider::default());
    for _ in 0..3 {
        provider.push_establish(Err(ResilienceError::message("ECONNREFUSED")));
    }
    let registry = registry_with(provider.clone()).await;
    let mut rx = registry.subscribe();

    let err = registry.connect("p").await.unwrap_err();
    assert!(matches!(
        err,
        ResilienceError::ConnectionFailed { attempts: 3, ref reason } if reason == "ECONNREFUSED"
    ));
    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Error);
    assert!(event_names(&mut rx).contains(&"error"));

    // A later explicit connect starts a fresh attempt budget
    registry.connect("p").await.unwrap();
    assert_eq!(provider.establish_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_health_failures_below_threshold_keep_connection() {
    let provider = Arc::new(ScriptedProvider::default());
    let registry = registry_with(provider.clone()).await;
    registry.connect("p").await.unwrap();

    for _ in 0..2 {
        provider.push_health(Err(ResilienceError::Network("connection refused".into())));
    }
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(provider.health_calls(), 2);
    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Connected);
    let health = registry.health("p").await.unwrap();
    assert_eq!(health.consecutive_failures, 2);
    assert_eq!(health.status, HealthStatus::Unknown);
    assert_eq!(provider.establish_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_health_failures_beyond_threshold_reconnect() {
    let provider = Arc::new(ScriptedProvider::default());
    let registry = registry_with(provider.clone()).await;
    registry.connect("p").await.unwrap();
    let mut rx = registry.subscribe();

    for _ in 0..3 {
        provider.push_health(Err(ResilienceError::Network("connection refused".into())));
    }
    // Third failing probe at 3s, reconnect after a 100ms backoff
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(provider.establish_calls(), 2);
    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Connected);
    let names = event_names(&mut rx);
    assert_eq!(names.iter().filter(|n| **n == "health_check_failed").count(), 3);
    assert!(names.contains(&"reconnecting"));
    assert!(names.contains(&"connected"));

    // The next healthy probe resets the reconnect budget
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let manager = registry.manager("p").await.unwrap();
    assert_eq!(manager.attempts().await, 0);
    assert!(manager.is_monitoring().await);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restarts_health_thresholds() {
    let provider = Arc::new(ScriptedProvider::default());
    let registry = registry_with(provider.clone()).await;
    registry.connect("p").await.unwrap();

    for _ in 0..4 {
        provider.push_health(Err(ResilienceError::Network("connection refused".into())));
    }
    // Three failures reconnect at ~3.1s; the fourth lands at 4s on a fresh record
    tokio::time::sleep(Duration::from_millis(4500)).await;

    assert_eq!(provider.health_calls(), 4);
    assert_eq!(provider.establish_calls(), 2);
    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Connected);
    let health = registry.health("p").await.unwrap();
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(health.status, HealthStatus::Unknown);
}

#[tokio::test(start_paused = true)]
async fn test_non_transport_health_failure_is_terminal() {
    let provider = Arc::new(ScriptedProvider::default());
    let registry = registry_with(provider.clone()).await;
    registry.connect("p").await.unwrap();

    for _ in 0..3 {
        provider.push_health(Ok(HealthCheckResponse::error("model not loaded")));
    }
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Error);
    let status = registry.status("p").await.unwrap();
    assert!(!status.available);
    assert!(status.error.unwrap().contains("model not loaded"));
    assert_eq!(provider.establish_calls(), 1);

    // Monitoring stopped with the terminal error
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(provider.health_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_health_models_are_merged() {
    let provider = Arc::new(ScriptedProvider::default());
    let registry = registry_with(provider.clone()).await;
    registry.connect("p").await.unwrap();
    let mut rx = registry.subscribe();

    provider.push_health(Ok(HealthCheckResponse::ok().with_models(["llama3"])));
    provider.push_health(Ok(HealthCheckResponse::ok().with_models(["mistral"])));
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let status = registry.status("p").await.unwrap();
    assert_eq!(status.models, vec!["llama3", "mistral"]);
    assert!(status.last_checked.is_some());

    let mut model_events = 0;
    while let Ok(event) = rx.try_recv() {
        if let ResilienceEvent::ModelChanged { status, .. } = event {
            assert!(!status.models.is_empty());
            model_events += 1;
        }
    }
    assert_eq!(model_events, 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_health_checks() {
    let provider = Arc::new(ScriptedProvider::default());
    let registry = registry_with(provider.clone()).await;
    registry.connect("p").await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(provider.health_calls(), 1);

    registry.disconnect("p").await.unwrap();
    registry.disconnect("p").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(provider.health_calls(), 1);
    assert_eq!(provider.terminate_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    let status = registry.status("p").await.unwrap();
    assert!(!status.connected && !status.available);
}
