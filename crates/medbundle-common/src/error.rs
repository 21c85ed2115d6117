//! Error types shared across the medbundle workspace

use thiserror::Error;

/// Result type alias for medbundle operations
pub type Result<T> = std::result::Result<T, MedbundleError>;

/// Workspace-level error type
#[derive(Error, Debug)]
pub enum MedbundleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
