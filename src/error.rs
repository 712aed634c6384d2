//! Error types for CadenceDB

use thiserror::Error;

/// Result type alias for CadenceDB operations
pub type Result<T> = std::result::Result<T, CadenceError>;

/// CadenceDB error types
#[derive(Error, Debug)]
pub enum CadenceError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Expression construction or validation error
    #[error("Expression error: {0}")]
    Expr(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Table not found
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Field not part of the table schema
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// A filestore header disagrees with the table's configured schema
    #[error("Schema mismatch in {file}: field {field}")]
    SchemaMismatch { file: String, field: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CadenceError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, CadenceError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CadenceError::Corruption(_) | CadenceError::InvalidFormat(_)
        )
    }
}
