//! Error types for sqlx-sqlite-conn-mgr

use std::time::Duration;

use thiserror::Error;

/// Errors that may occur when working with sqlx-sqlite-conn-mgr
///
/// Resource-exhaustion variants ([`Error::QueueFull`], [`Error::Timeout`],
/// [`Error::Connection`]) are worth retrying with backoff. Execution variants
/// ([`Error::WriteExecution`], [`Error::Transaction`]) describe a statement that
/// the database refused and should surface as business errors.
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// The writer connection or the read pool could not be opened. The manager
   /// stays uninitialized and the next call retries initialization.
   #[error("Connection error: {0}")]
   Connection(String),

   /// The write queue is at capacity; the operation was not admitted
   #[error("Write queue is full (capacity {capacity})")]
   QueueFull { capacity: usize },

   /// A single statement failed inside a batch. Only that operation failed;
   /// the rest of the batch was unaffected.
   #[error("Write execution failed: {0}")]
   WriteExecution(String),

   /// The batch transaction itself failed (BEGIN or COMMIT), so nothing in it
   /// was persisted
   #[error("Transaction failed: {0}")]
   Transaction(String),

   /// Caller-side wait exceeded
   #[error("Operation timed out after {0:?}")]
   Timeout(Duration),

   /// Liveness check failed
   #[error("Health check failed: {0}")]
   HealthCheck(String),

   /// Table or column name rejected by batch insert validation.
   ///
   /// Names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
   #[error("invalid identifier '{0}': must match [a-zA-Z_][a-zA-Z0-9_]*")]
   InvalidIdentifier(String),

   /// A batch insert row does not have one value per column
   #[error("row {row} has {actual} values but {expected} columns were given")]
   RowWidthMismatch {
      row: usize,
      expected: usize,
      actual: usize,
   },

   /// SQLite type that cannot be mapped to JSON
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Configuration value out of range
   #[error("invalid configuration: {0}")]
   InvalidConfig(&'static str),

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Connection(_) => "CONNECTION_ERROR".to_string(),
         Error::QueueFull { .. } => "QUEUE_FULL".to_string(),
         Error::WriteExecution(_) => "WRITE_EXECUTION_ERROR".to_string(),
         Error::Transaction(_) => "TRANSACTION_ERROR".to_string(),
         Error::Timeout(_) => "TIMEOUT".to_string(),
         Error::HealthCheck(_) => "HEALTH_CHECK_FAILURE".to_string(),
         Error::InvalidIdentifier(_) => "INVALID_IDENTIFIER".to_string(),
         Error::RowWidthMismatch { .. } => "ROW_WIDTH_MISMATCH".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::InvalidConfig(_) => "INVALID_CONFIG".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
      }
   }

   /// Whether the failure is resource exhaustion that may clear up on retry.
   ///
   /// SQLite `BUSY` (5) and `LOCKED` (6) count as contention.
   pub fn is_retryable(&self) -> bool {
      match self {
         Error::QueueFull { .. } | Error::Timeout(_) | Error::Connection(_) => true,
         Error::Sqlx(sqlx::Error::PoolTimedOut) => true,
         Error::Sqlx(e) => e
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .is_some_and(|code| code == "5" || code == "6"),
         _ => false,
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_error_code_queue_full() {
      let err = Error::QueueFull { capacity: 8 };
      assert_eq!(err.error_code(), "QUEUE_FULL");
      assert!(err.to_string().contains("capacity 8"));
   }

   #[test]
   fn test_error_code_sqlx_non_database() {
      let err = Error::Sqlx(sqlx::Error::RowNotFound);
      assert_eq!(err.error_code(), "SQLX_ERROR");
   }

   #[test]
   fn test_error_code_row_width_mismatch() {
      let err = Error::RowWidthMismatch {
         row: 2,
         expected: 3,
         actual: 1,
      };
      assert_eq!(err.error_code(), "ROW_WIDTH_MISMATCH");
      assert!(err.to_string().contains("row 2"));
   }

   #[test]
   fn test_resource_exhaustion_is_retryable() {
      assert!(Error::QueueFull { capacity: 1 }.is_retryable());
      assert!(Error::Timeout(Duration::from_millis(5)).is_retryable());
      assert!(Error::Connection("no such file".into()).is_retryable());
      assert!(Error::Sqlx(sqlx::Error::PoolTimedOut).is_retryable());
   }

   #[test]
   fn test_execution_failures_are_not_retryable() {
      assert!(!Error::WriteExecution("constraint".into()).is_retryable());
      assert!(!Error::Transaction("commit".into()).is_retryable());
      assert!(!Error::DatabaseClosed.is_retryable());
      assert!(!Error::Sqlx(sqlx::Error::RowNotFound).is_retryable());
   }
}
