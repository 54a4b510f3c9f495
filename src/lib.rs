//! # betting-db-access
//!
//! Access to the betting platform's SQLite database from synchronous code.
//!
//! ## Core Types
//!
//! - **[`AccessCoordinator`]**: The entry point callers use for reads, writes
//!   and bulk inserts
//! - **[`CoordinatorConfig`]**: Mode plus the settings of every layer below
//! - **[`LegacyAccess`]**: Direct connections serialized by a `<db>.lock`
//!   advisory lock
//! - **[`Error`]**: Error type for coordinator operations
//!
//! ## Layers
//!
//! ```text
//! AccessCoordinator
//!   ├─ optimized: SyncBridgeAdapter → ConcurrentAccessManager → SQLite
//!   └─ legacy:    AdvisoryLock → fresh connection → SQLite
//! ```
//!
//! The optimized path pools reads and batches writes onto a single writer
//! connection. When it fails, the coordinator retries the call through the
//! legacy path.
//!
//! # Example
//!
//! ```no_run
//! use betting_db_access::{AccessCoordinator, CoordinatorConfig, Params};
//! use serde_json::json;
//!
//! # fn main() -> betting_db_access::Result<()> {
//! let db = AccessCoordinator::new("betting.db", CoordinatorConfig::default())?;
//!
//! db.execute_immediate_write(
//!    "CREATE TABLE IF NOT EXISTS races (id INTEGER PRIMARY KEY, venue TEXT)",
//!    Params::default(),
//! )?;
//! db.execute_write("INSERT INTO races (venue) VALUES ($1)", vec![json!("Tokyo")])?;
//!
//! let rows = db.execute_read("SELECT venue FROM races", vec![])?;
//! assert_eq!(rows[0]["venue"], json!("Tokyo"));
//!
//! db.stop()?;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod error;
mod file_lock;
mod legacy;
mod retry;

pub use coordinator::{AccessCoordinator, AccessMode, CoordinatorConfig, PerformanceStats, Status};
pub use error::{Error, Result};
pub use file_lock::{AdvisoryLock, lock_path_for};
pub use legacy::{LegacyAccess, LegacyConfig};
pub use retry::RetryConfig;

// Types callers need to build requests
pub use sqlx_sqlite_conn_mgr::{ConnectionConfig, OperationPriority, Params, Row, WriteResult};
pub use sqlx_sqlite_sync_bridge::{BridgeConfig, BulkInsert};
