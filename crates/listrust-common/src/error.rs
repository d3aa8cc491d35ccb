//! Error types for ListRust

use thiserror::Error;

/// Main error type for ListRust
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// An unrecognized enum or configuration value reached code that assumed
    /// it had been validated.
    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ListRust
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure is expected to go away on retry.
    ///
    /// Runners requeue items that fail transiently and shunt everything else
    /// to the dead-letter queue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Storage(_) | Error::Queue(_)
        )
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::FatalConfiguration(_) => "FATAL_CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Queue(_) => "QUEUE_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
