//! Configuration for the concurrent access manager

use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Configuration for [`ConcurrentAccessManager`](crate::ConcurrentAccessManager)
///
/// Supplied once at construction and never mutated afterwards.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_mgr::ConnectionConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = ConnectionConfig::default();
///
/// // Override just a few fields
/// let config = ConnectionConfig {
///     write_batch_size: 50,
///     write_flush_interval: Duration::from_millis(20),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
   /// Number of read-only connections available for concurrent reads
   ///
   /// Reads beyond this number wait for a free connection rather than
   /// being rejected.
   ///
   /// Default: 4
   pub reader_pool_size: u32,

   /// Maximum number of queued writes executed in one batch transaction
   ///
   /// Default: 100
   pub write_batch_size: usize,

   /// How often the background loop flushes the write queue
   ///
   /// Default: 100 milliseconds
   pub write_flush_interval: Duration,

   /// Capacity of the write queue. Writes submitted while the queue is full
   /// fail with [`Error::QueueFull`].
   ///
   /// Default: 10,000
   pub max_queue_depth: usize,

   /// Busy timeout on every connection and the wait limit for acquiring a
   /// read connection
   ///
   /// Default: 30 seconds
   pub connection_timeout: Duration,

   /// Open the database in write-ahead-log journal mode
   ///
   /// Default: true
   pub wal_mode: bool,

   /// WAL size, in pages, at which SQLite checkpoints automatically
   /// (`PRAGMA wal_autocheckpoint`). Ignored when `wal_mode` is false.
   ///
   /// Default: 1000
   pub checkpoint_frequency: u32,
}

impl Default for ConnectionConfig {
   fn default() -> Self {
      Self {
         reader_pool_size: 4,
         write_batch_size: 100,
         write_flush_interval: Duration::from_millis(100),
         max_queue_depth: 10_000,
         connection_timeout: Duration::from_secs(30),
         wal_mode: true,
         checkpoint_frequency: 1000,
      }
   }
}

impl ConnectionConfig {
   /// Reject settings the manager cannot run with.
   pub fn validate(&self) -> Result<()> {
      if self.reader_pool_size == 0 {
         return Err(Error::InvalidConfig("reader_pool_size must be at least 1"));
      }
      if self.write_batch_size == 0 {
         return Err(Error::InvalidConfig("write_batch_size must be at least 1"));
      }
      if self.max_queue_depth == 0 {
         return Err(Error::InvalidConfig("max_queue_depth must be at least 1"));
      }
      if self.write_flush_interval.is_zero() {
         return Err(Error::InvalidConfig(
            "write_flush_interval must be greater than zero",
         ));
      }
      Ok(())
   }
}
