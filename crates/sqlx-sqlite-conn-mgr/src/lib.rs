//! # sqlx-sqlite-conn-mgr
//!
//! A wrapper around SQLx that coordinates access to a SQLite database that
//! allows only one writer at a time.
//!
//! ## Core Types
//!
//! - **[`ConcurrentAccessManager`]**: Owns the single writer connection, the
//!   read pool and the background batch-flush loop
//! - **[`ConnectionConfig`]**: Pool size, batching and timeout settings
//! - **[`OperationPriority`]**: Ordering of writes within a flush batch
//! - **[`WriteHandle`]**: Future resolving to the outcome of a queued write
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Concurrent reads**: A pool of read-only connections serves reads in
//!   parallel; WAL mode keeps them from blocking the writer
//! - **Batched writes**: Writes are queued, grouped by the flush loop and run
//!   in one transaction per batch, highest priority first
//! - **Exclusive writes**: Batches and immediate writes share one connection
//!   behind one lock, so at most one write transaction is ever in flight
//! - **Lazy start**: Nothing is opened until the first call

mod batch;
mod config;
mod error;
mod manager;
mod priority;
mod queue;
mod statement;
mod value;

// Re-export public types
pub use config::ConnectionConfig;
pub use error::{Error, Result};
pub use manager::{ConcurrentAccessManager, ManagerStats};
pub use priority::OperationPriority;
pub use queue::WriteHandle;
pub use statement::build_batch_insert;
pub use value::{Params, Row, SqliteQuery, WriteResult, bind_all, decode_rows};
