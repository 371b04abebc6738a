//! Scripted in-memory provider shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tether::config::ResilienceSettings;
use tether::provider::{Connectable, ConnectionFactory, HealthCheckable, Poolable};
use tether_core_resilience::{HealthCheckResponse, ResilienceError};

#[derive(Debug, Clone)]
pub struct MockConn {
    pub serial: usize,
}

#[async_trait::async_trait]
impl Poolable for MockConn {
    async fn disconnect(&self) -> Result<(), ResilienceError> {
        Ok(())
    }
}

/// Replays queued outcomes; an empty queue means success
#[derive(Default)]
pub struct ScriptedProvider {
    establish: Mutex<VecDeque<Result<(), ResilienceError>>>,
    health: Mutex<VecDeque<Result<HealthCheckResponse, ResilienceError>>>,
    pub establish_calls: AtomicUsize,
    pub terminate_calls: AtomicUsize,
    pub health_calls: AtomicUsize,
    pub created: AtomicUsize,
}

impl ScriptedProvider {
    pub fn push_establish(&self, outcome: Result<(), ResilienceError>) {
        self.establish.lock().unwrap().push_back(outcome);
    }

    pub fn push_health(&self, outcome: Result<HealthCheckResponse, ResilienceError>) {
        self.health.lock().unwrap().push_back(outcome);
    }

    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connectable for ScriptedProvider {
    async fn establish_connection(&self) -> Result<(), ResilienceError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        self.establish.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn terminate_connection(&self) -> Result<(), ResilienceError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl HealthCheckable for ScriptedProvider {
    async fn perform_health_check(&self) -> Result<HealthCheckResponse, ResilienceError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.health
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HealthCheckResponse::ok()))
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<MockConn> for ScriptedProvider {
    async fn create(&self, _provider_id: &str) -> Result<MockConn, ResilienceError> {
        Ok(MockConn {
            serial: self.created.fetch_add(1, Ordering::SeqCst),
        })
    }
}

/// Short timers so paused-clock tests stay readable
pub fn fast_settings() -> ResilienceSettings {
    let mut settings = ResilienceSettings::default();
    settings.retry.base_delay_ms = 100;
    settings.retry.max_delay_ms = 1000;
    settings.health.check_interval_ms = 1000;
    settings.health.timeout_ms = 500;
    settings
}
