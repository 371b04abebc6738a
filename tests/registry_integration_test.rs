//! Request path through the registry: rate limiter, pool, metrics and
//! transport-error reporting, plus unregister and shutdown cleanup.

mod common;

use common::{fast_settings, MockConn, ScriptedProvider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether::ProviderRegistry;
use tether_core_resilience::{ConnectionState, ResilienceError};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_execute_bounds_concurrency_per_provider() {
    let mut settings = fast_settings();
    settings.pool.max_size = 2;
    let registry = Arc::new(ProviderRegistry::<MockConn>::new(&settings));
    let provider = Arc::new(ScriptedProvider::default());
    registry.register("p", provider.clone(), &settings).await.unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let registry = registry.clone();
        let active = active.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .execute("p", |_conn| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError>(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(provider.created.load(Ordering::SeqCst), 2);
    let metrics = registry.metrics("p").await;
    assert_eq!(metrics.successful_requests, 5);
    assert_eq!(metrics.connections_established, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_delays_requests_beyond_burst() {
    let mut settings = fast_settings();
    settings.rate_limit.burst_size = 2;
    settings.rate_limit.requests_per_second = 1.0;
    let registry = ProviderRegistry::<MockConn>::new(&settings);
    registry
        .register("p", Arc::new(ScriptedProvider::default()), &settings)
        .await
        .unwrap();

    let started = Instant::now();
    for _ in 0..3 {
        registry
            .execute("p", |_conn| async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap();
    }

    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(registry.available_tokens("p").await < 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_triggers_reconnect() {
    let settings = fast_settings();
    let registry = ProviderRegistry::<MockConn>::new(&settings);
    let provider = Arc::new(ScriptedProvider::default());
    registry.register("p", provider.clone(), &settings).await.unwrap();
    registry.connect("p").await.unwrap();
    let mut rx = registry.subscribe();

    let err = registry
        .execute("p", |_conn| async {
            Err::<(), _>(ResilienceError::message("read ECONNRESET"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "read ECONNRESET");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(provider.establish_calls(), 2);
    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Connected);

    let mut saw_reconnecting = false;
    while let Ok(event) = rx.try_recv() {
        saw_reconnecting |= event.name() == "reconnecting";
    }
    assert!(saw_reconnecting);

    let metrics = registry.metrics("p").await;
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.errors.get("Error"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_application_error_does_not_reconnect() {
    let settings = fast_settings();
    let registry = ProviderRegistry::<MockConn>::new(&settings);
    let provider = Arc::new(ScriptedProvider::default());
    registry.register("p", provider.clone(), &settings).await.unwrap();
    registry.connect("p").await.unwrap();

    let err = registry
        .execute("p", |_conn| async {
            Err::<(), _>(ResilienceError::ModelNotFound("gpt-5".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::ModelNotFound(_)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(provider.establish_calls(), 1);
    assert_eq!(registry.state("p").await.unwrap(), ConnectionState::Connected);
    assert_eq!(registry.pool_stats("p").await.unwrap().in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_releases_everything() {
    let settings = fast_settings();
    let registry = ProviderRegistry::<MockConn>::new(&settings);
    let provider = Arc::new(ScriptedProvider::default());
    registry.register("p", provider.clone(), &settings).await.unwrap();
    registry.connect("p").await.unwrap();
    registry
        .execute("p", |_conn| async { Ok::<_, ResilienceError>(()) })
        .await
        .unwrap();

    registry.unregister("p").await.unwrap();

    assert!(registry.providers().await.is_empty());
    assert!(registry.pool_stats("p").await.is_none());
    assert!(registry.health("p").await.is_none());
    assert_eq!(registry.all_metrics().await.len(), 0);
    assert_eq!(provider.terminate_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        registry.state("p").await,
        Err(ResilienceError::ProviderNotFound(_))
    ));
    assert!(matches!(
        registry.unregister("p").await,
        Err(ResilienceError::ProviderNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_all() {
    let settings = fast_settings();
    let registry = ProviderRegistry::<MockConn>::new(&settings);
    let a = Arc::new(ScriptedProvider::default());
    let b = Arc::new(ScriptedProvider::default());
    registry.register("a", a.clone(), &settings).await.unwrap();
    registry.register("b", b.clone(), &settings).await.unwrap();
    registry.connect("a").await.unwrap();
    registry.connect("b").await.unwrap();
    let mut rx = registry.subscribe();

    registry.shutdown().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    for id in ["a", "b"] {
        assert_eq!(registry.state(id).await.unwrap(), ConnectionState::Disconnected);
    }
    assert_eq!(a.health_calls(), 0);
    assert_eq!(b.health_calls(), 0);

    let mut disconnected = 0;
    while let Ok(event) = rx.try_recv() {
        if event.name() == "disconnected" {
            disconnected += 1;
        }
    }
    assert_eq!(disconnected, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_execute_returns_connection() {
    let mut settings = fast_settings();
    settings.pool.max_size = 2;
    let registry = ProviderRegistry::<MockConn>::new(&settings);
    registry
        .register("p", Arc::new(ScriptedProvider::default()), &settings)
        .await
        .unwrap();

    for _ in 0..2 {
        let outcome = tokio::time::timeout(
            Duration::from_millis(1),
            registry.execute("p", |_conn| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, ResilienceError>(())
            }),
        )
        .await;
        assert!(outcome.is_err());
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let stats = registry.pool_stats("p").await.unwrap();
    assert_eq!(stats.in_use, 0);

    let started = Instant::now();
    registry
        .execute("p", |_conn| async { Ok::<_, ResilienceError>(()) })
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}
