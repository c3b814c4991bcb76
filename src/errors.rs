// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::execution::Failure;

#[derive(Error, Debug)]
pub enum RunbridgeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Port allocation failed: {0}")]
    PortAllocation(String),

    #[error("Failed to launch test runner: {0}")]
    LaunchFailed(String),

    #[error("Event channel connection already open")]
    ConnectionAlreadyOpen,

    #[error("Event channel connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Test server failure: {0}")]
    SystemFailure(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Test session failed: {0}")]
    SessionFailed(String),

    #[error("Test discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Another test action is already running")]
    ActionInProgress,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunbridgeError {
    /// True when the error stems from an explicitly requested stop rather
    /// than a genuine failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RunbridgeError::Cancelled(_))
    }
}

impl From<Failure> for RunbridgeError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Cancelled(msg) => RunbridgeError::Cancelled(msg),
            Failure::Error(msg) => RunbridgeError::SystemFailure(msg),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RunbridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_failure_maps_to_cancellation() {
        let err = RunbridgeError::from(Failure::Cancelled("stopped".into()));
        assert!(err.is_cancellation());

        let err = RunbridgeError::from(Failure::Error("boom".into()));
        assert!(!err.is_cancellation());
        assert_eq!(err.to_string(), "Test server failure: boom");
    }
}
