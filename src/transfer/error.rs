//! Transfer Error Types
//!
//! Business errors are terminal and never retried. Store, timeout and publish
//! errors are retryable by the saga step policy.

use serde::Serialize;
use thiserror::Error;

/// API status a caller-facing layer should map an error to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiStatus {
    NotFound,
    InvalidArgument,
    Internal,
}

impl ApiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStatus::NotFound => "NOT_FOUND",
            ApiStatus::InvalidArgument => "INVALID_ARGUMENT",
            ApiStatus::Internal => "INTERNAL",
        }
    }
}

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Business Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Validation failed: {0}")]
    Validation(String),

    // === Retryable Errors ===
    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Step timed out: {0}")]
    Timeout(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    // === Query Errors ===
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // === System Errors ===
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            TransferError::Validation(_) => "VALIDATION_ERROR",
            TransferError::TransientStore(_) => "TRANSIENT_STORE_ERROR",
            TransferError::Timeout(_) => "TIMEOUT",
            TransferError::Publish(_) => "PUBLISH_ERROR",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            TransferError::Database(_) => "DATABASE_ERROR",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Whether a saga step may be re-attempted after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::TransientStore(_) | TransferError::Timeout(_) | TransferError::Publish(_)
        )
    }

    pub fn api_status(&self) -> ApiStatus {
        match self {
            TransferError::AccountNotFound(_) | TransferError::TransferNotFound(_) => {
                ApiStatus::NotFound
            }
            TransferError::InsufficientFunds | TransferError::Validation(_) => {
                ApiStatus::InvalidArgument
            }
            _ => ApiStatus::Internal,
        }
    }
}

/// PostgreSQL SQLSTATEs worth retrying: serialization failure, deadlock,
/// lock not available, statement cancelled (lock_timeout)
const RETRYABLE_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "57014"];

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let retryable = db
                    .code()
                    .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code.as_ref()));
                if retryable {
                    TransferError::TransientStore(e.to_string())
                } else {
                    TransferError::Database(e.to_string())
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => TransferError::TransientStore(e.to_string()),
            _ => TransferError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::SystemError(format!("step output codec: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferError::InsufficientFunds.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(
            TransferError::AccountNotFound("ghost".into()).code(),
            "ACCOUNT_NOT_FOUND"
        );
        assert_eq!(TransferError::Timeout("debit".into()).code(), "TIMEOUT");
    }

    #[test]
    fn test_api_status() {
        assert_eq!(
            TransferError::AccountNotFound("x".into()).api_status(),
            ApiStatus::NotFound
        );
        assert_eq!(
            TransferError::InsufficientFunds.api_status(),
            ApiStatus::InvalidArgument
        );
        assert_eq!(
            TransferError::Validation("bad".into()).api_status(),
            ApiStatus::InvalidArgument
        );
        assert_eq!(
            TransferError::TransientStore("conn reset".into()).api_status(),
            ApiStatus::Internal
        );
        assert_eq!(
            TransferError::Publish("bus down".into()).api_status(),
            ApiStatus::Internal
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(TransferError::TransientStore("x".into()).is_retryable());
        assert!(TransferError::Timeout("x".into()).is_retryable());
        assert!(TransferError::Publish("x".into()).is_retryable());

        assert!(!TransferError::InsufficientFunds.is_retryable());
        assert!(!TransferError::AccountNotFound("x".into()).is_retryable());
        assert!(!TransferError::Validation("x".into()).is_retryable());
        assert!(!TransferError::Database("unique violation".into()).is_retryable());
    }

    #[test]
    fn test_sqlx_pool_errors_are_transient() {
        let err: TransferError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());

        let err: TransferError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, TransferError::Database(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TransferError::InsufficientFunds.to_string(),
            "Insufficient funds"
        );
    }
}
