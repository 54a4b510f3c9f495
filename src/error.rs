use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the access coordinator and its legacy path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the blocking bridge.
   #[error(transparent)]
   Bridge(#[from] sqlx_sqlite_sync_bridge::Error),

   /// Error from the access manager, raised by shared helpers on the legacy path.
   #[error(transparent)]
   Manager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// Error from a direct legacy connection.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// I/O error, usually from the lock file.
   #[error(transparent)]
   Io(#[from] std::io::Error),

   /// The advisory lock stayed held by someone else for the whole wait.
   #[error("timed out after {waited:?} waiting for lock {}", path.display())]
   LockTimeout { path: PathBuf, waited: Duration },

   /// The runtime driving legacy connections could not be built.
   #[error("failed to build legacy runtime: {0}")]
   Runtime(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Bridge(e) => e.error_code(),
         Error::Manager(e) => e.error_code(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::LockTimeout { .. } => "LOCK_TIMEOUT".to_string(),
         Error::Runtime(_) => "RUNTIME_ERROR".to_string(),
      }
   }

   /// Whether retrying the same call later may succeed.
   ///
   /// SQLite reports a busy or locked database as codes 5 and 6.
   pub fn is_retryable(&self) -> bool {
      match self {
         Error::Bridge(e) => e.is_retryable(),
         Error::Manager(e) => e.is_retryable(),
         Error::Sqlx(sqlx::Error::PoolTimedOut) => true,
         Error::Sqlx(e) => e
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .is_some_and(|code| code == "5" || code == "6"),
         Error::LockTimeout { .. } => true,
         Error::Io(_) | Error::Runtime(_) => false,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_error_code_passes_through_bridge_codes() {
      let err = Error::from(sqlx_sqlite_sync_bridge::Error::Stopped);
      assert_eq!(err.error_code(), "ADAPTER_STOPPED");
      assert!(!err.is_retryable());
   }

   #[test]
   fn test_lock_timeout() {
      let err = Error::LockTimeout {
         path: PathBuf::from("/tmp/races.db.lock"),
         waited: Duration::from_millis(300),
      };
      assert_eq!(err.error_code(), "LOCK_TIMEOUT");
      assert!(err.is_retryable());
      assert!(err.to_string().contains("races.db.lock"));
   }

   #[test]
   fn test_sqlx_non_database_error() {
      let err = Error::from(sqlx::Error::RowNotFound);
      assert_eq!(err.error_code(), "SQLX_ERROR");
      assert!(!err.is_retryable());
   }
}
