/*!
 * Provider capability traits
 *
 * A provider plugs into the resilience layer by implementing the capabilities
 * it has: [`Connectable`] for the state machine, [`HealthCheckable`] for the
 * health monitor and [`ConnectionFactory`] for the pool.
 */

use tether_core_resilience::ResilienceError;

pub use tether_core_resilience::{ConnectionFactory, HealthCheckable, Poolable};

/// Establishes and tears down the logical connection to a provider
#[async_trait::async_trait]
pub trait Connectable: Send + Sync {
    async fn establish_connection(&self) -> Result<(), ResilienceError>;

    async fn terminate_connection(&self) -> Result<(), ResilienceError>;
}

/// Everything the connection manager needs from a provider
pub trait Provider: Connectable + HealthCheckable {}

impl<T: Connectable + HealthCheckable> Provider for T {}
