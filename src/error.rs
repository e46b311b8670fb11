use thiserror::Error;

use crate::firewall::FirewallError;

/// Result type alias for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Error types for the manager library
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Firewall tool failures
    #[error("Firewall error: {0}")]
    Firewall(FirewallError),

    /// Refused because it would cut off administrative access to the host
    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    /// Tunnel binary could not be started
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Network interface management errors
    #[error("Interface error: {0}")]
    Interface(String),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl From<FirewallError> for ManagerError {
    fn from(err: FirewallError) -> Self {
        match err {
            FirewallError::ReservedPort(_) => ManagerError::SafetyViolation(err.to_string()),
            other => ManagerError::Firewall(other),
        }
    }
}

impl From<config::ConfigError> for ManagerError {
    fn from(err: config::ConfigError) -> Self {
        ManagerError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        ManagerError::Config(err.to_string())
    }
}
