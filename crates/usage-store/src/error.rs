//! Usage store errors

use thiserror::Error;

/// Errors that can occur when reading or writing image usage records
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database driver or connection error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored row could not be turned back into an event
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Store is temporarily unable to accept writes
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Connection-level failures are transient; malformed records are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(e) => !matches!(
                e,
                sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::Encode(_)
            ),
            StoreError::Unavailable(_) => true,
            StoreError::InvalidRecord(_) => false,
        }
    }
}
