//! Error types for source federation

use std::io;
use thiserror::Error;

/// Source service error type
#[derive(Error, Debug)]
pub enum SourceError {
    /// Bad identifier, bad enum value, missing required field. Raised before
    /// any side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Source alias or folder id does not resolve (or is detached).
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Live attachment failed. A status=error row has already been recorded.
    #[error("Failed to attach source '{name}': {message}")]
    Attach { name: String, message: String },

    /// Materialization of a cached table failed. No metadata was written.
    #[error("Failed to cache table '{table}': {message}")]
    Cache { table: String, message: String },

    #[error("Database error: {0}")]
    Backend(#[from] duckyard_db::BackendError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SourceError {
    pub fn validation(message: impl Into<String>) -> Self {
        SourceError::Validation(message.into())
    }

    pub fn cache(table: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SourceError::Cache {
            table: table.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::SourceNotFound(_))
    }
}

/// Result type for source operations
pub type Result<T> = std::result::Result<T, SourceError>;
