use std::time::Duration;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for blocking bridge calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the access manager.
   #[error(transparent)]
   Manager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// The calling thread stopped waiting. The scheduled work may still run.
   #[error("call timed out after {0:?}")]
   Timeout(Duration),

   /// The adapter was stopped and cannot be restarted.
   #[error("adapter has been stopped")]
   Stopped,

   /// The scheduler thread or its runtime could not be created.
   #[error("failed to start scheduler: {0}")]
   Runtime(#[from] std::io::Error),

   /// The scheduled task ended without producing a result.
   #[error("scheduled task failed: {0}")]
   TaskFailed(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Manager(e) => e.error_code(),
         Error::Timeout(_) => "TIMEOUT".to_string(),
         Error::Stopped => "ADAPTER_STOPPED".to_string(),
         Error::Runtime(_) => "RUNTIME_ERROR".to_string(),
         Error::TaskFailed(_) => "TASK_FAILED".to_string(),
      }
   }

   /// Whether retrying the same call later may succeed.
   pub fn is_retryable(&self) -> bool {
      match self {
         Error::Manager(e) => e.is_retryable(),
         Error::Timeout(_) => true,
         _ => false,
      }
   }
}
