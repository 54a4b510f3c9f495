//! Direct connections serialized by an advisory file lock
//!
//! Every call takes the `<db>.lock` lock, opens a fresh connection, runs,
//! and closes it again. Slow, but independent of the access manager, so it
//! keeps working when the optimized path does not.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use sqlx_sqlite_conn_mgr::{
   ConnectionConfig, Params, Row, WriteResult, bind_all, build_batch_insert, decode_rows,
};
use sqlx_sqlite_sync_bridge::BulkInsert;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::file_lock::{AdvisoryLock, lock_path_for};
use crate::retry::{RetryConfig, retry};
use crate::{Error, Result};

/// Settings for the file-locked legacy path
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
   /// How often a blocked caller retries the lock
   ///
   /// Default: 10 milliseconds
   pub lock_poll_interval: Duration,

   /// How long a caller waits for the lock before giving up
   ///
   /// Default: 30 seconds
   pub lock_timeout: Duration,

   /// Backoff for reads that find the database busy
   pub read_retry: RetryConfig,
}

impl Default for LegacyConfig {
   fn default() -> Self {
      Self {
         lock_poll_interval: Duration::from_millis(10),
         lock_timeout: Duration::from_secs(30),
         read_retry: RetryConfig::default(),
      }
   }
}

/// Lock-then-connect access to one database file
pub struct LegacyAccess {
   lock_path: PathBuf,
   options: SqliteConnectOptions,
   config: LegacyConfig,
   runtime: Runtime,
   operations: AtomicU64,
}

impl LegacyAccess {
   /// Prepare the legacy path for `path`. Nothing is opened until the first call.
   ///
   /// Journal mode and busy timeout follow `connection`, so legacy connections
   /// agree with the access manager on the same file.
   pub fn new(path: &Path, connection: &ConnectionConfig, config: LegacyConfig) -> Result<Self> {
      let mut options = SqliteConnectOptions::new()
         .filename(path)
         .create_if_missing(true)
         .busy_timeout(connection.connection_timeout);
      if connection.wal_mode {
         options = options.journal_mode(SqliteJournalMode::Wal);
      }

      // Callers block on this runtime from their own threads; the worker
      // drives timers for backoff sleeps
      let runtime = tokio::runtime::Builder::new_multi_thread()
         .worker_threads(1)
         .thread_name("legacy-sqlite")
         .enable_all()
         .build()
         .map_err(|e| Error::Runtime(e.to_string()))?;

      Ok(Self {
         lock_path: lock_path_for(path),
         options,
         config,
         runtime,
         operations: AtomicU64::new(0),
      })
   }

   pub fn lock_path(&self) -> &Path {
      &self.lock_path
   }

   /// Calls completed through this path, successful or not
   pub fn operations(&self) -> u64 {
      self.operations.load(Ordering::Relaxed)
   }

   pub fn execute_read(&self, query: &str, params: Vec<JsonValue>) -> Result<Vec<Row>> {
      self.locked(|| {
         self.runtime.block_on(retry(&self.config.read_retry, "legacy read", || {
            let params = params.clone();
            async move {
               let mut conn = self.connect().await?;
               let result = bind_all(query, params).fetch_all(&mut conn).await;
               close(conn).await;
               Ok(decode_rows(result?)?)
            }
         }))
      })
   }

   pub fn execute_write(&self, query: &str, params: impl Into<Params>) -> Result<WriteResult> {
      let params = params.into();
      self.locked(|| self.runtime.block_on(self.write(query, params)))
   }

   /// Returns the number of rows inserted
   pub fn execute_bulk_insert(&self, bulk: BulkInsert) -> Result<u64> {
      let (query, params) = match bulk {
         BulkInsert::Table {
            table,
            columns,
            rows,
         } => {
            if rows.is_empty() {
               return Ok(0);
            }
            let (query, values) = build_batch_insert(&table, &columns, rows)?;
            (query, Params::Single(values))
         }
         BulkInsert::Statement { query, rows } => {
            if rows.is_empty() {
               return Ok(0);
            }
            (query, Params::Batch(rows))
         }
      };

      let result = self.execute_write(&query, params)?;
      Ok(result.rows_affected)
   }

   fn locked<T>(&self, call: impl FnOnce() -> Result<T>) -> Result<T> {
      let _lock = AdvisoryLock::acquire(
         &self.lock_path,
         self.config.lock_poll_interval,
         self.config.lock_timeout,
      )?;
      let result = call();
      self.operations.fetch_add(1, Ordering::Relaxed);
      result
   }

   async fn connect(&self) -> Result<SqliteConnection> {
      Ok(self.options.connect().await?)
   }

   /// Every parameter tuple runs in one transaction; any failure rolls back all
   async fn write(&self, query: &str, params: Params) -> Result<WriteResult> {
      let mut conn = self.connect().await?;
      let result = run_in_transaction(&mut conn, query, params).await;
      close(conn).await;
      result
   }
}

async fn run_in_transaction(
   conn: &mut SqliteConnection,
   query: &str,
   params: Params,
) -> Result<WriteResult> {
   let mut tx = conn.begin().await?;
   let tuples = match params {
      Params::Single(values) => vec![values],
      Params::Batch(rows) => rows,
   };

   let mut result = WriteResult::default();
   for values in tuples {
      let done = bind_all(query, values).execute(&mut *tx).await?;
      result.rows_affected += done.rows_affected();
      result.last_insert_id = done.last_insert_rowid();
   }

   // Dropping an uncommitted transaction rolls it back
   tx.commit().await?;
   Ok(result)
}

async fn close(conn: SqliteConnection) {
   if let Err(e) = conn.close().await {
      debug!(error = %e, "Error closing legacy connection");
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;
   use tempfile::TempDir;

   fn legacy(temp: &TempDir) -> LegacyAccess {
      LegacyAccess::new(
         &temp.path().join("legacy.db"),
         &ConnectionConfig::default(),
         LegacyConfig::default(),
      )
      .unwrap()
   }

   #[test]
   fn test_write_then_read() {
      let temp = TempDir::new().unwrap();
      let access = legacy(&temp);

      access
         .execute_write("CREATE TABLE odds (runner TEXT, price REAL)", Params::default())
         .unwrap();
      let result = access
         .execute_write(
            "INSERT INTO odds (runner, price) VALUES ($1, $2)",
            vec![json!("Auguste Rodin"), json!(3.5)],
         )
         .unwrap();
      assert_eq!(result.rows_affected, 1);
      assert_eq!(result.last_insert_id, 1);

      let rows = access
         .execute_read("SELECT runner, price FROM odds", Vec::new())
         .unwrap();
      assert_eq!(rows.len(), 1);
      assert_eq!(rows[0]["runner"], json!("Auguste Rodin"));
      assert_eq!(rows[0]["price"], json!(3.5));
      assert_eq!(access.operations(), 3);
      assert!(temp.path().join("legacy.db.lock").exists());
   }

   #[test]
   fn test_batch_params_are_atomic() {
      let temp = TempDir::new().unwrap();
      let access = legacy(&temp);
      access
         .execute_write("CREATE TABLE odds (runner TEXT NOT NULL)", Params::default())
         .unwrap();

      let err = access
         .execute_write(
            "INSERT INTO odds (runner) VALUES ($1)",
            vec![vec![json!("Paddington")], vec![JsonValue::Null]],
         )
         .unwrap_err();
      assert!(matches!(err, Error::Sqlx(_)));

      let rows = access
         .execute_read("SELECT COUNT(*) AS n FROM odds", Vec::new())
         .unwrap();
      assert_eq!(rows[0]["n"], json!(0));
   }

   #[test]
   fn test_bulk_insert_table_and_statement() {
      let temp = TempDir::new().unwrap();
      let access = legacy(&temp);
      access
         .execute_write("CREATE TABLE odds (runner TEXT, price REAL)", Params::default())
         .unwrap();

      let inserted = access
         .execute_bulk_insert(BulkInsert::Table {
            table: "odds".into(),
            columns: vec!["runner".into(), "price".into()],
            rows: vec![
               vec![json!("Ace Impact"), json!(2.0)],
               vec![json!("Westover"), json!(7.5)],
            ],
         })
         .unwrap();
      assert_eq!(inserted, 2);

      let inserted = access
         .execute_bulk_insert(BulkInsert::Statement {
            query: "INSERT INTO odds (runner, price) VALUES ($1, $2)".into(),
            rows: vec![vec![json!("Onesto"), json!(11.0)]],
         })
         .unwrap();
      assert_eq!(inserted, 1);

      let empty = access
         .execute_bulk_insert(BulkInsert::Statement {
            query: "INSERT INTO odds (runner, price) VALUES ($1, $2)".into(),
            rows: Vec::new(),
         })
         .unwrap();
      assert_eq!(empty, 0);
   }

   #[test]
   fn test_held_lock_times_out_call() {
      let temp = TempDir::new().unwrap();
      let access = LegacyAccess::new(
         &temp.path().join("legacy.db"),
         &ConnectionConfig::default(),
         LegacyConfig {
            lock_timeout: Duration::from_millis(30),
            ..Default::default()
         },
      )
      .unwrap();

      let _held = AdvisoryLock::acquire(
         access.lock_path(),
         Duration::from_millis(5),
         Duration::from_secs(1),
      )
      .unwrap();

      let err = access.execute_read("SELECT 1", Vec::new()).unwrap_err();
      assert!(matches!(err, Error::LockTimeout { .. }));
      assert_eq!(access.operations(), 0);
   }
}
