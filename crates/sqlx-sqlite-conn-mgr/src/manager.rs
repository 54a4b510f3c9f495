//! Single-writer SQLite access with a concurrent read pool and batched writes

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{
   SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
   SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection};
use tokio::sync::{OnceCell, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::batch::{self, BatchReport, Metrics};
use crate::config::ConnectionConfig;
use crate::priority::OperationPriority;
use crate::queue::{WriteHandle, WriteQueue};
use crate::statement::build_batch_insert;
use crate::value::{Params, Row, WriteResult, bind_all, decode_rows};
use crate::{Error, Result};

/// Coordinates all access to one SQLite database file.
///
/// ## Architecture
///
/// - **Writer**: exactly one read-write connection, owned for the manager's
///   whole lifetime and never handed out. Every write transaction runs on it
///   while holding its lock, so at most one write transaction is ever in flight.
/// - **Write queue**: bounded FIFO of pending writes. A background loop wakes
///   every `write_flush_interval`, takes up to `write_batch_size` operations,
///   orders them by priority and runs them in one transaction.
/// - **Read pool**: `reader_pool_size` read-only connections. SQLite's WAL
///   snapshots give each read a consistent view without blocking the writer.
///
/// ## Lifecycle
///
/// ```text
/// 1. new()        no I/O
/// 2. first call   opens writer + read pool, starts flush loop (once)
/// 3. cleanup()    stops flush loop, drains queue, closes pool and writer
/// ```
pub struct ConcurrentAccessManager {
   path: PathBuf,
   config: ConnectionConfig,
   queue: Arc<WriteQueue>,
   metrics: Arc<Metrics>,
   /// Initialization lock: concurrent first callers share one open attempt,
   /// and a failed attempt leaves the cell empty for the next caller
   running: OnceCell<Running>,
   closed: AtomicBool,
}

/// State that exists only once the database is open
struct Running {
   shared: Arc<Shared>,
   flush_task: Mutex<Option<FlushTask>>,
}

struct FlushTask {
   handle: JoinHandle<()>,
   shutdown: oneshot::Sender<()>,
}

/// Resources shared with the background flush loop
struct Shared {
   /// `None` once closed
   writer: tokio::sync::Mutex<Option<SqliteConnection>>,
   read_pool: SqlitePool,
   queue: Arc<WriteQueue>,
   metrics: Arc<Metrics>,
   batch_size: usize,
}

/// Point-in-time view of the manager's configuration and counters
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
   pub pool_size: u32,
   pub queue_depth: usize,
   pub queue_capacity: usize,
   pub batch_size: usize,
   pub flush_interval: Duration,
   pub initialized: bool,
   pub batches_committed: u64,
   pub operations_committed: u64,
   pub operations_failed: u64,
   /// Calls to the statement execution primitive, excluding transaction
   /// control statements
   pub statements_executed: u64,
   /// Highest number of write transactions ever observed in flight at once
   pub peak_active_writers: usize,
}

impl ConcurrentAccessManager {
   /// Create a manager for the database at `path`. Nothing is opened until
   /// the first call (or [`initialize`](Self::initialize)).
   pub fn new(path: impl AsRef<Path>, config: ConnectionConfig) -> Self {
      let queue = Arc::new(WriteQueue::new(config.max_queue_depth));
      Self {
         path: path.as_ref().to_path_buf(),
         config,
         queue,
         metrics: Arc::new(Metrics::default()),
         running: OnceCell::new(),
         closed: AtomicBool::new(false),
      }
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn config(&self) -> &ConnectionConfig {
      &self.config
   }

   /// Open the writer and read pool and start the flush loop.
   ///
   /// Idempotent. On failure the manager stays uninitialized and the next
   /// call tries again.
   pub async fn initialize(&self) -> Result<()> {
      self.shared().await.map(|_| ())
   }

   /// Run a query on the read pool and decode every row.
   ///
   /// When every read connection is busy the call waits for one, up to
   /// `connection_timeout`.
   pub async fn execute_read(&self, query: &str, params: Vec<JsonValue>) -> Result<Vec<Row>> {
      let shared = self.shared().await?;
      let rows = bind_all(query, params).fetch_all(&shared.read_pool).await?;
      decode_rows(rows)
   }

   /// Queue a write and wait for the batch that executes it.
   pub async fn execute_write(
      &self,
      query: &str,
      params: impl Into<Params>,
      priority: OperationPriority,
   ) -> Result<WriteResult> {
      self.submit_write(query, params, priority).await?.await
   }

   /// Admit a write to the queue without waiting for it to execute.
   ///
   /// Fails with [`Error::QueueFull`] when the queue is at capacity. The
   /// returned handle resolves once the write's batch has committed or failed.
   pub async fn submit_write(
      &self,
      query: &str,
      params: impl Into<Params>,
      priority: OperationPriority,
   ) -> Result<WriteHandle> {
      self.shared().await?;
      self
         .queue
         .push(query.to_string(), params.into(), priority, false)
   }

   /// Insert many rows with a single multi-row statement queued as one write.
   ///
   /// Returns the number of rows inserted. An empty `rows` is a no-op.
   pub async fn execute_batch_insert(
      &self,
      table: &str,
      columns: &[String],
      rows: Vec<Vec<JsonValue>>,
      priority: OperationPriority,
   ) -> Result<u64> {
      if rows.is_empty() {
         return Ok(0);
      }

      let row_count = rows.len();
      let (sql, values) = build_batch_insert(table, columns, rows)?;
      self.shared().await?;

      let handle = self
         .queue
         .push(sql, Params::Single(values), priority, true)?;
      debug!(table, rows = row_count, seq = handle.seq(), "Queued batch insert");

      Ok(handle.await?.rows_affected)
   }

   /// Execute a write right away in its own transaction, skipping the queue.
   ///
   /// Still serialized with batch flushes through the writer lock; it only
   /// avoids waiting for the next flush tick.
   pub async fn execute_immediate_write(
      &self,
      query: &str,
      params: impl Into<Params>,
   ) -> Result<WriteResult> {
      let shared = self.shared().await?;
      let mut writer = shared.writer.lock().await;
      let conn = writer.as_mut().ok_or(Error::DatabaseClosed)?;

      let _slot = shared.metrics.enter_writer();
      batch::execute_immediate(conn, query, params.into(), &shared.metrics).await
   }

   /// Verify writer liveness and run a representative read.
   pub async fn check_health(&self) -> Result<()> {
      let shared = self.shared().await?;

      {
         let mut writer = shared.writer.lock().await;
         let conn = writer.as_mut().ok_or(Error::DatabaseClosed)?;
         conn
            .ping()
            .await
            .map_err(|e| Error::HealthCheck(format!("writer ping failed: {e}")))?;
      }

      let (one,): (i64,) = sqlx::query_as("SELECT 1")
         .fetch_one(&shared.read_pool)
         .await
         .map_err(|e| Error::HealthCheck(format!("read check failed: {e}")))?;

      if one != 1 {
         return Err(Error::HealthCheck(format!("read check returned {one}")));
      }
      Ok(())
   }

   /// [`check_health`](Self::check_health) reduced to a flag; failures are logged.
   pub async fn health_check(&self) -> bool {
      match self.check_health().await {
         Ok(()) => true,
         Err(e) => {
            warn!(path = %self.path.display(), error = %e, "Health check failed");
            false
         }
      }
   }

   pub fn queue_depth(&self) -> usize {
      self.queue.len()
   }

   pub fn is_initialized(&self) -> bool {
      self.running.initialized() && !self.closed.load(Ordering::Acquire)
   }

   pub fn stats(&self) -> ManagerStats {
      ManagerStats {
         pool_size: self.config.reader_pool_size,
         queue_depth: self.queue.len(),
         queue_capacity: self.queue.capacity(),
         batch_size: self.config.write_batch_size,
         flush_interval: self.config.write_flush_interval,
         initialized: self.is_initialized(),
         batches_committed: self.metrics.batches_committed.load(Ordering::Relaxed),
         operations_committed: self.metrics.operations_committed.load(Ordering::Relaxed),
         operations_failed: self.metrics.operations_failed.load(Ordering::Relaxed),
         statements_executed: self.metrics.statements_executed.load(Ordering::Relaxed),
         peak_active_writers: self.metrics.peak_active_writers.load(Ordering::Relaxed),
      }
   }

   /// Shut down: stop the flush loop, flush what is still queued, close the
   /// read pool and the writer.
   ///
   /// Writes that cannot be flushed are failed with [`Error::DatabaseClosed`].
   /// Every later call returns [`Error::DatabaseClosed`]. Idempotent.
   pub async fn cleanup(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::AcqRel) {
         return Ok(());
      }

      // Waits out an open already in flight. Otherwise this attempt claims the
      // cell and fails, so no later open can start.
      let running = match self
         .running
         .get_or_try_init(|| async { Err::<Running, _>(Error::DatabaseClosed) })
         .await
      {
         Ok(running) => running,
         Err(_) => {
            debug!(path = %self.path.display(), "Cleanup before initialization");
            return Ok(());
         }
      };

      let task = running.flush_task.lock().take();
      if let Some(task) = task {
         let _ = task.shutdown.send(());
         if let Err(e) = task.handle.await {
            warn!(error = %e, "Flush loop ended abnormally");
         }
      }

      // Best-effort drain; stop at the first batch that fails to commit
      loop {
         let report = running.shared.flush_once().await;
         if report.size == 0 || !report.committed {
            break;
         }
      }

      let leftover = self.queue.close();
      if !leftover.is_empty() {
         warn!(count = leftover.len(), "Failing writes left in queue at shutdown");
         for op in leftover {
            op.resolve(Err(Error::DatabaseClosed));
         }
      }

      running.shared.read_pool.close().await;

      let writer = running.shared.writer.lock().await.take();
      if let Some(conn) = writer {
         conn.close().await?;
      }

      debug!(path = %self.path.display(), "Database closed");
      Ok(())
   }

   async fn shared(&self) -> Result<&Arc<Shared>> {
      if self.closed.load(Ordering::Acquire) {
         return Err(Error::DatabaseClosed);
      }
      let running = self.running.get_or_try_init(|| self.open()).await?;
      if self.closed.load(Ordering::Acquire) {
         return Err(Error::DatabaseClosed);
      }
      Ok(&running.shared)
   }

   async fn open(&self) -> Result<Running> {
      // Runs under the cell's init lock, so cleanup either sees the opened
      // state or this check sees cleanup
      if self.closed.load(Ordering::Acquire) {
         return Err(Error::DatabaseClosed);
      }
      self.config.validate()?;

      let mut write_options = SqliteConnectOptions::new()
         .filename(&self.path)
         .create_if_missing(true)
         .busy_timeout(self.config.connection_timeout);

      write_options = if self.config.wal_mode {
         write_options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma(
               "wal_autocheckpoint",
               self.config.checkpoint_frequency.to_string(),
            )
      } else {
         write_options.journal_mode(SqliteJournalMode::Delete)
      };

      let writer = write_options.connect().await.map_err(|e| {
         Error::Connection(format!(
            "failed to open writer for {}: {e}",
            self.path.display()
         ))
      })?;

      // Opened after the writer so the file exists and the journal mode is set
      let read_options = SqliteConnectOptions::new()
         .filename(&self.path)
         .read_only(true)
         .busy_timeout(self.config.connection_timeout);

      let read_pool = match SqlitePoolOptions::new()
         .max_connections(self.config.reader_pool_size)
         .acquire_timeout(self.config.connection_timeout)
         .connect_with(read_options)
         .await
      {
         Ok(pool) => pool,
         Err(e) => {
            let _ = writer.close().await;
            return Err(Error::Connection(format!(
               "failed to open read pool for {}: {e}",
               self.path.display()
            )));
         }
      };

      let shared = Arc::new(Shared {
         writer: tokio::sync::Mutex::new(Some(writer)),
         read_pool,
         queue: Arc::clone(&self.queue),
         metrics: Arc::clone(&self.metrics),
         batch_size: self.config.write_batch_size,
      });

      let (shutdown, shutdown_rx) = oneshot::channel();
      let handle = tokio::spawn(run_flush_loop(
         Arc::clone(&shared),
         self.config.write_flush_interval,
         shutdown_rx,
      ));

      debug!(
         path = %self.path.display(),
         readers = self.config.reader_pool_size,
         wal = self.config.wal_mode,
         "Database opened"
      );

      Ok(Running {
         shared,
         flush_task: Mutex::new(Some(FlushTask { handle, shutdown })),
      })
   }
}

impl Shared {
   /// Pop one batch and run it on the writer.
   async fn flush_once(&self) -> BatchReport {
      let batch = self.queue.pop_batch(self.batch_size);
      if batch.is_empty() {
         return BatchReport::default();
      }

      let mut writer = self.writer.lock().await;
      let Some(conn) = writer.as_mut() else {
         let size = batch.len();
         for op in batch {
            op.resolve(Err(Error::DatabaseClosed));
         }
         return BatchReport {
            size,
            committed: false,
         };
      };

      let _slot = self.metrics.enter_writer();
      let report = batch::execute_batch(conn, batch, &self.metrics).await;
      trace!(size = report.size, committed = report.committed, "Flushed write batch");
      report
   }
}

async fn run_flush_loop(
   shared: Arc<Shared>,
   interval: Duration,
   mut shutdown: oneshot::Receiver<()>,
) {
   // First tick one full interval from now, so writes submitted right after
   // startup share a batch
   let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
   ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

   loop {
      tokio::select! {
         _ = ticker.tick() => {
            shared.flush_once().await;
         }
         // Fires on an explicit shutdown and when the manager is dropped
         _ = &mut shutdown => {
            debug!("Flush loop stopping");
            break;
         }
      }
   }
}
