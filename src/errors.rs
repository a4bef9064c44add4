/// Domain-specific error types for regmatch
///
/// Only a total failure of every retrieval signal reaches the caller of a search;
/// everything else is recovered locally and logged.

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegmatchError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Every enabled retrieval signal failed for this query.
    #[error("All retrieval signals failed: {0}")]
    AllSignalsFailed(String),
}

impl From<sqlx::Error> for RegmatchError {
    fn from(e: sqlx::Error) -> Self {
        RegmatchError::Storage(e.to_string())
    }
}

impl From<crate::embedding::EmbeddingError> for RegmatchError {
    fn from(e: crate::embedding::EmbeddingError) -> Self {
        RegmatchError::Internal(e.to_string())
    }
}

impl RegmatchError {
    /// Helper to create validation errors with field names
    ///
    /// Example:
    /// ```
    /// use regmatch::errors::RegmatchError;
    /// let err = RegmatchError::validation("top_k", "top_k must be positive");
    /// ```
    pub fn validation(field: &str, message: &str) -> Self {
        RegmatchError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }
}
