//! Error types shared across the ingestor workspace

use thiserror::Error;

/// Result type alias for ingestor operations
pub type Result<T> = std::result::Result<T, IngestorError>;

/// Errors raised while loading configuration, schemas and input files
#[derive(Error, Debug)]
pub enum IngestorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),
}

impl IngestorError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }
}
