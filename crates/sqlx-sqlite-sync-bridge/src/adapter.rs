//! Blocking facade over the asynchronous access manager

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx_sqlite_conn_mgr::{
   ConcurrentAccessManager, ManagerStats, OperationPriority, Params, Row, WriteResult,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// Lifecycle of a [`SyncBridgeAdapter`]
///
/// `Uninitialized → Initializing → Ready → Stopped`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
   Uninitialized,
   Initializing,
   Ready,
   Stopped,
}

enum State {
   Uninitialized,
   Initializing,
   Ready(Scheduler),
   Stopped,
}

impl State {
   fn kind(&self) -> AdapterState {
      match self {
         State::Uninitialized => AdapterState::Uninitialized,
         State::Initializing => AdapterState::Initializing,
         State::Ready(_) => AdapterState::Ready,
         State::Stopped => AdapterState::Stopped,
      }
   }
}

/// Rows for a bulk insert, in either of the two shapes callers use
#[derive(Debug, Clone)]
pub enum BulkInsert {
   /// Build one multi-row INSERT for `table`
   Table {
      table: String,
      columns: Vec<String>,
      rows: Vec<Vec<JsonValue>>,
   },
   /// Run a caller-supplied statement once per parameter tuple, atomically
   Statement {
      query: String,
      rows: Vec<Vec<JsonValue>>,
   },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
   Read,
   Write,
}

/// Adapter state plus the wrapped manager's stats
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
   pub state: AdapterState,
   pub manager: ManagerStats,
   /// Reads cancelled because the caller timed out
   pub cancelled_reads: u64,
   /// Writes the caller gave up on; they may still have committed
   pub abandoned_writes: u64,
}

/// Lets synchronous code call into a [`ConcurrentAccessManager`].
///
/// A dedicated thread runs a tokio runtime that owns all of the manager's
/// background work. Each call is spawned onto that runtime and the calling
/// thread blocks until the result arrives or the timeout passes.
///
/// On timeout, reads are cancelled. Writes are left to finish: the manager
/// may already have executed them, so the caller cannot assume a timed-out
/// write did not happen.
///
/// Calls block the current thread, so they must not be made from inside an
/// async task.
pub struct SyncBridgeAdapter {
   manager: Arc<ConcurrentAccessManager>,
   config: BridgeConfig,
   state: Mutex<State>,
   cancelled_reads: AtomicU64,
   abandoned_writes: AtomicU64,
}

impl SyncBridgeAdapter {
   pub fn new(manager: Arc<ConcurrentAccessManager>, config: BridgeConfig) -> Self {
      Self {
         manager,
         config,
         state: Mutex::new(State::Uninitialized),
         cancelled_reads: AtomicU64::new(0),
         abandoned_writes: AtomicU64::new(0),
      }
   }

   pub fn manager(&self) -> &Arc<ConcurrentAccessManager> {
      &self.manager
   }

   pub fn state(&self) -> AdapterState {
      self.state.lock().kind()
   }

   /// Start the scheduler and open the database. Other calls do this lazily.
   pub fn start(&self) -> Result<()> {
      self.run(None, CallKind::Write, |db| async move { db.initialize().await })
   }

   pub fn execute_read(
      &self,
      query: &str,
      params: Vec<JsonValue>,
      timeout: Option<Duration>,
   ) -> Result<Vec<Row>> {
      let query = query.to_string();
      self.run(timeout, CallKind::Read, move |db| async move {
         db.execute_read(&query, params).await
      })
   }

   /// Single writes go straight to the writer rather than waiting for the
   /// next batch flush.
   pub fn execute_write(
      &self,
      query: &str,
      params: impl Into<Params>,
      timeout: Option<Duration>,
   ) -> Result<WriteResult> {
      self.execute_immediate_write(query, params, timeout)
   }

   pub fn execute_immediate_write(
      &self,
      query: &str,
      params: impl Into<Params>,
      timeout: Option<Duration>,
   ) -> Result<WriteResult> {
      let query = query.to_string();
      let params = params.into();
      self.run(timeout, CallKind::Write, move |db| async move {
         db.execute_immediate_write(&query, params).await
      })
   }

   /// Queue a write for the next batch flush. `priority` defaults to
   /// [`OperationPriority::Normal`].
   pub fn execute_queued_write(
      &self,
      query: &str,
      params: impl Into<Params>,
      priority: Option<OperationPriority>,
      timeout: Option<Duration>,
   ) -> Result<WriteResult> {
      let query = query.to_string();
      let params = params.into();
      let priority = priority.unwrap_or_default();
      self.run(timeout, CallKind::Write, move |db| async move {
         db.execute_write(&query, params, priority).await
      })
   }

   /// Insert many rows through the batch queue. Returns rows inserted.
   pub fn execute_bulk_insert(
      &self,
      bulk: BulkInsert,
      priority: Option<OperationPriority>,
      timeout: Option<Duration>,
   ) -> Result<u64> {
      let priority = priority.unwrap_or_default();
      self.run(timeout, CallKind::Write, move |db| async move {
         match bulk {
            BulkInsert::Table {
               table,
               columns,
               rows,
            } => db.execute_batch_insert(&table, &columns, rows, priority).await,
            BulkInsert::Statement { query, rows } => {
               if rows.is_empty() {
                  return Ok(0);
               }
               let result = db.execute_write(&query, Params::Batch(rows), priority).await?;
               Ok(result.rows_affected)
            }
         }
      })
   }

   /// Whether the scheduler is running and the manager passes its health
   /// check. Never starts the adapter.
   pub fn is_healthy(&self) -> bool {
      if self.state() != AdapterState::Ready {
         return false;
      }
      self
         .run(None, CallKind::Read, |db| async move {
            Ok::<_, sqlx_sqlite_conn_mgr::Error>(db.health_check().await)
         })
         .unwrap_or(false)
   }

   pub fn queue_size(&self) -> usize {
      self.manager.queue_depth()
   }

   pub fn stats(&self) -> BridgeStats {
      BridgeStats {
         state: self.state(),
         manager: self.manager.stats(),
         cancelled_reads: self.cancelled_reads.load(Ordering::Relaxed),
         abandoned_writes: self.abandoned_writes.load(Ordering::Relaxed),
      }
   }

   /// Clean up the manager, stop the scheduler and join its thread.
   ///
   /// Terminal: every later call returns [`Error::Stopped`]. Idempotent.
   pub fn stop(&self) -> Result<()> {
      let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
      let State::Ready(scheduler) = previous else {
         return Ok(());
      };

      let manager = Arc::clone(&self.manager);
      let cleanup = Self::block_on(
         scheduler.handle(),
         self.config.default_timeout,
         async move { manager.cleanup().await },
         CallKind::Write,
      );
      scheduler.shutdown(self.config.join_timeout);

      match cleanup {
         Ok(Ok(())) => Ok(()),
         Ok(Err(e)) => Err(e.into()),
         Err(e) => {
            warn!(error = %e, "Manager cleanup did not finish");
            Err(e)
         }
      }
   }

   fn scheduler_handle(&self) -> Result<Handle> {
      let mut state = self.state.lock();
      match &*state {
         State::Ready(scheduler) => return Ok(scheduler.handle().clone()),
         State::Stopped => return Err(Error::Stopped),
         State::Uninitialized | State::Initializing => {}
      }

      // The lock is held for the whole start, so concurrent first callers
      // wait here instead of starting a second scheduler
      *state = State::Initializing;
      match Scheduler::spawn(&self.config.thread_name) {
         Ok(scheduler) => {
            let handle = scheduler.handle().clone();
            *state = State::Ready(scheduler);
            Ok(handle)
         }
         Err(e) => {
            *state = State::Uninitialized;
            Err(e)
         }
      }
   }

   fn run<T, F, Fut>(&self, timeout: Option<Duration>, kind: CallKind, call: F) -> Result<T>
   where
      F: FnOnce(Arc<ConcurrentAccessManager>) -> Fut,
      Fut: Future<Output = sqlx_sqlite_conn_mgr::Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let handle = self.scheduler_handle()?;
      let timeout = timeout.unwrap_or(self.config.default_timeout);

      match Self::block_on(&handle, timeout, call(Arc::clone(&self.manager)), kind) {
         Ok(result) => Ok(result?),
         Err(Error::Timeout(waited)) => {
            match kind {
               CallKind::Read => {
                  self.cancelled_reads.fetch_add(1, Ordering::Relaxed);
               }
               CallKind::Write => {
                  self.abandoned_writes.fetch_add(1, Ordering::Relaxed);
               }
            }
            Err(Error::Timeout(waited))
         }
         Err(e) => Err(e),
      }
   }

   /// Spawn `fut` on the scheduler and block for its output.
   ///
   /// On timeout a read task is aborted; a write task is left running.
   fn block_on<T, Fut>(handle: &Handle, timeout: Duration, fut: Fut, kind: CallKind) -> Result<T>
   where
      Fut: Future<Output = T> + Send + 'static,
      T: Send + 'static,
   {
      let (tx, rx) = mpsc::sync_channel(1);
      let task = handle.spawn(async move {
         let _ = tx.send(fut.await);
      });

      match rx.recv_timeout(timeout) {
         Ok(output) => Ok(output),
         Err(RecvTimeoutError::Timeout) => {
            match kind {
               CallKind::Read => {
                  task.abort();
                  debug!(timeout_ms = timeout.as_millis() as u64, "Read timed out; cancelled");
               }
               CallKind::Write => {
                  warn!(
                     timeout_ms = timeout.as_millis() as u64,
                     "Write timed out; it may still complete"
                  );
               }
            }
            Err(Error::Timeout(timeout))
         }
         Err(RecvTimeoutError::Disconnected) => Err(Error::TaskFailed(
            "task ended without a result (panicked or scheduler stopped)".into(),
         )),
      }
   }
}

impl Drop for SyncBridgeAdapter {
   fn drop(&mut self) {
      let state = std::mem::replace(self.state.get_mut(), State::Stopped);
      if let State::Ready(scheduler) = state {
         let pending = self.manager.queue_depth();
         if pending > 0 {
            warn!(pending, "Adapter dropped without stop(); queued writes are abandoned");
         }
         // Dropping the scheduler ends its runtime without joining the thread
         drop(scheduler);
      }
   }
}
