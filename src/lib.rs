/*!
 * Tether - resilient connections to LLM inference providers
 *
 * Keeps a small set of logical connections to remote providers alive,
 * healthy and fairly shared across concurrent callers:
 * - Per-provider connection state machine with retrying connect and reconnect
 * - Bounded per-provider connection pool with a FIFO wait queue
 * - Token-bucket rate limiting
 * - Periodic health probes with threshold hysteresis
 * - Request metrics and a single notification bus
 *
 * The primitives live in `tether-core-resilience`; this crate wires them
 * together, loads configuration and provides a generic HTTP provider.
 */

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod manager;
pub mod provider;
pub mod registry;

// Re-export commonly used types
pub use config::{ResilienceSettings, ResolvedProvider, TetherConfig};
pub use error::{Result, TetherError};
pub use http::{HttpConnection, HttpProvider};
pub use manager::{ConnectionManager, RecoveryOutcome};
pub use provider::{Connectable, Provider};
pub use registry::ProviderRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
