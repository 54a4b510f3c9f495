//! # sqlx-sqlite-sync-bridge
//!
//! Blocking access to [`sqlx_sqlite_conn_mgr::ConcurrentAccessManager`] for
//! code that is not async.
//!
//! The adapter lazily starts one dedicated scheduler thread running a tokio
//! runtime. Every call is spawned onto that runtime while the caller blocks
//! with a timeout, so the manager's flush loop and read pool live on a single
//! runtime no matter how many threads call in.

mod adapter;
mod config;
mod error;
mod scheduler;

pub use adapter::{AdapterState, BridgeStats, BulkInsert, SyncBridgeAdapter};
pub use config::BridgeConfig;
pub use error::{Error, Result};
