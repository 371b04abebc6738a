/*!
 * Error types for Tether
 */

use std::io;
use tether_core_resilience::ResilienceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;

#[derive(Error, Debug)]
pub enum TetherError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed configuration file
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// HTTP client setup or transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Failure inside the resilience layer
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl TetherError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TetherError::Config(_)
            | TetherError::Toml(_)
            | TetherError::TomlSerialize(_)
            | TetherError::Resilience(ResilienceError::InvalidConfiguration(_)) => EXIT_CONFIG,
            _ => EXIT_FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resilience_error_is_transparent() {
        let err: TetherError = ResilienceError::ProviderNotFound("ollama".into()).into();
        assert_eq!(err.to_string(), "Provider not found: ollama");
        assert_eq!(err.exit_code(), EXIT_FATAL);
    }

    #[test]
    fn test_config_errors_exit_code() {
        let err = TetherError::Config("bad".into());
        assert_eq!(err.exit_code(), EXIT_CONFIG);

        let err: TetherError =
            ResilienceError::InvalidConfiguration("max_size must be > 0".into()).into();
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }
}
