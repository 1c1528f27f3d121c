//! Error types for the asset layer

use std::io;
use thiserror::Error;

/// Asset error type
#[derive(Error, Debug)]
pub enum AssetError {
    /// Bad id, bad SQL, missing parameter, unresolvable dependency, cycle.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A run or export could not produce its result.
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Database error: {0}")]
    Backend(#[from] duckyard_db::BackendError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Source(#[from] duckyard_sources::SourceError),
}

impl AssetError {
    pub fn validation(message: impl Into<String>) -> Self {
        AssetError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AssetError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AssetError::NotFound(_))
    }
}

/// Result type for asset operations
pub type Result<T> = std::result::Result<T, AssetError>;
