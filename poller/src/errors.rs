//! Error types for the deployment poller

use thiserror::Error;

/// Main error type for the poller
#[derive(Error, Debug)]
pub enum PollerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Conflict error: {0}")]
    ConflictError(String),

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PollerError {
    /// Whether the error came from an external collaborator (git or compose)
    /// rather than from the poller's own filesystem or configuration.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            PollerError::NetworkError(_)
                | PollerError::ConflictError(_)
                | PollerError::BuildError(_)
                | PollerError::CommandError(_)
        )
    }
}
