//! Generic HTTP provider
//!
//! Probes a single configured endpoint with a `GET`; any 2xx answer means the
//! provider is up. No provider-specific payloads are parsed.

use crate::error::Result;
use crate::provider::{Connectable, ConnectionFactory, HealthCheckable, Poolable};
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tether_core_resilience::{HealthCheckResponse, ResilienceError};
use tracing::debug;

/// A pooled handle onto the provider's HTTP client
#[derive(Debug, Clone)]
pub struct HttpConnection {
    pub client: Client,
    pub endpoint: Url,
}

#[async_trait::async_trait]
impl Poolable for HttpConnection {
    async fn disconnect(&self) -> std::result::Result<(), ResilienceError> {
        // reqwest closes idle sockets when the last client clone drops
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ResilienceError::InvalidEndpoint(format!("{} ({})", endpoint, e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn get(&self) -> std::result::Result<StatusCode, ResilienceError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(response.status())
    }

    fn transport_error(&self, err: reqwest::Error) -> ResilienceError {
        if err.is_timeout() {
            ResilienceError::Timeout(self.timeout)
        } else {
            ResilienceError::Network(format!("{}: {}", self.endpoint, err))
        }
    }

    fn status_error(&self, status: StatusCode) -> ResilienceError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ResilienceError::AuthenticationFailed(format!("{} returned {}", self.endpoint, status))
            }
            StatusCode::NOT_FOUND => {
                ResilienceError::InvalidEndpoint(format!("{} returned {}", self.endpoint, status))
            }
            _ => ResilienceError::Network(format!("{} returned {}", self.endpoint, status)),
        }
    }
}

#[async_trait::async_trait]
impl Connectable for HttpProvider {
    async fn establish_connection(&self) -> std::result::Result<(), ResilienceError> {
        let status = self.get().await?;
        if status.is_success() {
            debug!(endpoint = %self.endpoint, %status, "Endpoint reachable");
            Ok(())
        } else {
            Err(self.status_error(status))
        }
    }

    async fn terminate_connection(&self) -> std::result::Result<(), ResilienceError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl HealthCheckable for HttpProvider {
    async fn perform_health_check(&self) -> std::result::Result<HealthCheckResponse, ResilienceError> {
        let status = self.get().await?;
        let mut response = if status.is_success() {
            HealthCheckResponse::ok()
        } else {
            HealthCheckResponse::error(self.status_error(status).to_string())
        };
        response
            .metadata
            .insert("http_status".to_string(), status.as_u16().to_string());
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<HttpConnection> for HttpProvider {
    async fn create(&self, _provider_id: &str) -> std::result::Result<HttpConnection, ResilienceError> {
        Ok(HttpConnection {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
        })
    }
}
