use std::time;

use rdkafka::error::KafkaError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while validating configuration at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flow control low watermark ({low}) must be lower than the high watermark ({high})")]
    InvalidWatermarks { high: u64, low: u64 },
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// Errors raised by a broker consumer when asked to pause or resume.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer {0} is gone")]
    Gone(String),
}

/// Errors returned by the storage collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no progress found for job execution {0}")]
    NotFound(Uuid),
    #[error("storage rejected the write: {0}")]
    Permanent(String),
    #[error("storage is temporarily unavailable: {0}")]
    Transient(String),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
}

impl StoreError {
    /// Whether writing the same data again could succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::NotFound(_) | StoreError::Permanent(_) => false,
            StoreError::Transient(_) => true,
            StoreError::QueryError { error, .. } => is_retryable_sqlx_error(error),
        }
    }
}

// Foreign key and check violations will fail the same way every time, anything else
// (pool exhaustion, dropped connections, serialization failures) is worth another attempt.
fn is_retryable_sqlx_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::RowNotFound
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => false,
        sqlx::Error::Database(db_error) => !matches!(
            db_error.code().as_deref(),
            Some("23503") | Some("23514") | Some("22003")
        ),
        _ => true,
    }
}

/// The outcome of a single failed persistence attempt, as seen by the dispatcher.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("persistence failed and can be retried: {0}")]
    Transient(String),
    #[error("persistence failed permanently: {0}")]
    Permanent(String),
    #[error("persistence timed out after {0:?}")]
    Timeout(time::Duration),
}

impl FlushError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FlushError::Permanent(_))
    }
}

impl From<StoreError> for FlushError {
    fn from(error: StoreError) -> Self {
        if error.is_retryable() {
            FlushError::Transient(error.to_string())
        } else {
            FlushError::Permanent(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(!StoreError::NotFound(Uuid::nil()).is_retryable());
        assert!(!StoreError::Permanent("check violation".to_owned()).is_retryable());
        assert!(StoreError::Transient("pool timed out".to_owned()).is_retryable());
        assert!(StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error: sqlx::Error::PoolTimedOut,
        }
        .is_retryable());
        assert!(!StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error: sqlx::Error::RowNotFound,
        }
        .is_retryable());
    }

    #[test]
    fn test_flush_error_from_store_error() {
        let flush_error = FlushError::from(StoreError::NotFound(Uuid::nil()));
        assert!(matches!(flush_error, FlushError::Permanent(_)));
        assert!(!flush_error.is_retryable());

        let flush_error = FlushError::from(StoreError::Transient("down".to_owned()));
        assert!(matches!(flush_error, FlushError::Transient(_)));
        assert!(flush_error.is_retryable());

        assert!(FlushError::Timeout(time::Duration::from_secs(1)).is_retryable());
    }
}
