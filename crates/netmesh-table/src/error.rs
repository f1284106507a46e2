//! Error types for the translation table.

use thiserror::Error;

/// Result type alias for table operations.
pub type TableResult<T> = Result<T, TableError>;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("invalid table entry: {0}")]
    InvalidEntry(String),

    #[error("not found: {0}")]
    NotFound(String),
}
