//! Error types for plugfleet

use thiserror::Error;

/// Main error type for plugfleet
#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Compare-and-swap conflict on key: {0}")]
    CasConflict(String),

    #[error("Deployment lease is held by {0}")]
    LeaseHeld(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Remote error on {server}: {message}")]
    RemoteError { server: String, message: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployerError {
    pub fn remote(server: impl Into<String>, message: impl Into<String>) -> Self {
        DeployerError::RemoteError {
            server: server.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for DeployerError {
    fn from(err: anyhow::Error) -> Self {
        DeployerError::Internal(err.to_string())
    }
}
