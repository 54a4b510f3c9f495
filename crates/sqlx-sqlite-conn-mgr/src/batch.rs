//! Executing writes on the single writer connection

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use sqlx::sqlite::SqliteConnection;
use tracing::{error, trace, warn};

use crate::queue::WriteOperation;
use crate::value::{Params, WriteResult, bind_all};
use crate::{Error, Result};

/// Counters shared by the flush loop, immediate writes and stats reporting.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
   pub(crate) batches_committed: AtomicU64,
   pub(crate) operations_committed: AtomicU64,
   pub(crate) operations_failed: AtomicU64,
   pub(crate) statements_executed: AtomicU64,
   active_writers: AtomicUsize,
   pub(crate) peak_active_writers: AtomicUsize,
}

impl Metrics {
   /// Mark a write transaction as in flight until the returned slot drops.
   pub(crate) fn enter_writer(&self) -> WriterSlot<'_> {
      let now = self.active_writers.fetch_add(1, Ordering::AcqRel) + 1;
      self.peak_active_writers.fetch_max(now, Ordering::AcqRel);
      WriterSlot { metrics: self }
   }
}

pub(crate) struct WriterSlot<'a> {
   metrics: &'a Metrics,
}

impl Drop for WriterSlot<'_> {
   fn drop(&mut self) {
      self.metrics.active_writers.fetch_sub(1, Ordering::AcqRel);
   }
}

/// What happened to one popped batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BatchReport {
   pub(crate) size: usize,
   pub(crate) committed: bool,
}

/// Run one batch in a single transaction.
///
/// Each operation runs inside its own savepoint, so a failing statement rolls
/// back only its own changes. Handles are resolved strictly after COMMIT
/// returns: if the commit fails, operations that had succeeded are failed
/// with [`Error::Transaction`] because nothing they did was persisted.
///
/// A statement that ends the whole transaction stops the batch there. The
/// remaining operations never run and are failed with [`Error::Transaction`].
pub(crate) async fn execute_batch(
   conn: &mut SqliteConnection,
   batch: Vec<WriteOperation>,
   metrics: &Metrics,
) -> BatchReport {
   let size = batch.len();

   if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
      error!(size, error = %e, "Failed to begin write batch");
      let message = format!("begin failed: {e}");
      metrics
         .operations_failed
         .fetch_add(size as u64, Ordering::Relaxed);
      for op in batch {
         op.resolve(Err(Error::Transaction(message.clone())));
      }
      return BatchReport {
         size,
         committed: false,
      };
   }

   let mut outcomes = Vec::with_capacity(size);
   let mut pending = batch.into_iter();
   while let Some(mut op) = pending.next() {
      let params = std::mem::take(&mut op.params);
      match execute_in_savepoint(conn, &op.query, params, metrics).await {
         StepOutcome::Done(result) => {
            if let Err(ref e) = result {
               warn!(seq = op.seq, bulk = op.bulk, error = %e, "Write failed inside batch");
            }
            outcomes.push((op, result));
         }
         StepOutcome::TransactionLost { cause, unwind } => {
            error!(
               seq = op.seq,
               error = %cause,
               unwind = %unwind,
               "Write batch transaction lost"
            );
            rollback(conn).await;
            metrics
               .operations_failed
               .fetch_add(size as u64, Ordering::Relaxed);

            let message = format!("batch transaction lost: {unwind}");
            for (done, result) in outcomes {
               let result = match result {
                  Ok(_) => Err(Error::Transaction(message.clone())),
                  Err(own) => Err(own),
               };
               done.resolve(result);
            }
            op.resolve(Err(cause));
            for skipped in pending {
               skipped.resolve(Err(Error::Transaction(message.clone())));
            }
            return BatchReport {
               size,
               committed: false,
            };
         }
      }
   }

   match sqlx::query("COMMIT").execute(&mut *conn).await {
      Ok(_) => {
         metrics.batches_committed.fetch_add(1, Ordering::Relaxed);
         for (op, result) in outcomes {
            match result {
               Ok(_) => metrics.operations_committed.fetch_add(1, Ordering::Relaxed),
               Err(_) => metrics.operations_failed.fetch_add(1, Ordering::Relaxed),
            };
            trace!(
               seq = op.seq,
               priority = ?op.priority,
               queued_ms = op.queued_for().as_millis() as u64,
               "Write resolved"
            );
            op.resolve(result);
         }
         BatchReport {
            size,
            committed: true,
         }
      }
      Err(e) => {
         error!(size, error = %e, "Write batch commit failed");
         rollback(conn).await;

         let message = format!("commit failed: {e}");
         metrics
            .operations_failed
            .fetch_add(size as u64, Ordering::Relaxed);
         for (op, result) in outcomes {
            let result = match result {
               Ok(_) => Err(Error::Transaction(message.clone())),
               Err(own) => Err(own),
            };
            op.resolve(result);
         }
         BatchReport {
            size,
            committed: false,
         }
      }
   }
}

/// Run a single write in its own transaction, outside the queue.
pub(crate) async fn execute_immediate(
   conn: &mut SqliteConnection,
   query: &str,
   params: Params,
   metrics: &Metrics,
) -> Result<WriteResult> {
   sqlx::query("BEGIN IMMEDIATE")
      .execute(&mut *conn)
      .await
      .map_err(|e| Error::Transaction(format!("begin failed: {e}")))?;

   let result = match run_statement(conn, query, params, metrics).await {
      Ok(result) => result,
      Err(e) => {
         rollback(conn).await;
         metrics.operations_failed.fetch_add(1, Ordering::Relaxed);
         return Err(Error::WriteExecution(e.to_string()));
      }
   };

   if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
      rollback(conn).await;
      metrics.operations_failed.fetch_add(1, Ordering::Relaxed);
      return Err(Error::Transaction(format!("commit failed: {e}")));
   }

   metrics.operations_committed.fetch_add(1, Ordering::Relaxed);
   Ok(result)
}

/// Result of one operation inside the batch transaction
enum StepOutcome {
   /// The transaction is intact; the operation committed to its savepoint or
   /// was rolled back to it
   Done(Result<WriteResult>),
   /// The enclosing transaction is gone or in an unknown state, for example
   /// after `INSERT OR ROLLBACK` or a trigger's `RAISE(ROLLBACK)`. Nothing
   /// more may run in this batch.
   TransactionLost { cause: Error, unwind: String },
}

async fn execute_in_savepoint(
   conn: &mut SqliteConnection,
   query: &str,
   params: Params,
   metrics: &Metrics,
) -> StepOutcome {
   if let Err(e) = sqlx::query("SAVEPOINT batch_op").execute(&mut *conn).await {
      return StepOutcome::TransactionLost {
         cause: Error::WriteExecution(format!("savepoint failed: {e}")),
         unwind: format!("savepoint failed: {e}"),
      };
   }

   match run_statement(conn, query, params, metrics).await {
      Ok(result) => match sqlx::query("RELEASE batch_op").execute(&mut *conn).await {
         Ok(_) => StepOutcome::Done(Ok(result)),
         Err(e) => StepOutcome::TransactionLost {
            cause: Error::Transaction(format!("release failed: {e}")),
            unwind: format!("release failed: {e}"),
         },
      },
      Err(e) => {
         // ROLLBACK TO keeps the savepoint open, so release it afterwards.
         // Either failing means the statement already ended the transaction.
         for undo in ["ROLLBACK TO batch_op", "RELEASE batch_op"] {
            if let Err(undo_err) = sqlx::query(undo).execute(&mut *conn).await {
               return StepOutcome::TransactionLost {
                  cause: Error::WriteExecution(e.to_string()),
                  unwind: format!("{undo} failed: {undo_err}"),
               };
            }
         }
         StepOutcome::Done(Err(Error::WriteExecution(e.to_string())))
      }
   }
}

/// Execute the statement once per parameter tuple. Every call here counts as
/// one statement in [`Metrics::statements_executed`].
async fn run_statement(
   conn: &mut SqliteConnection,
   query: &str,
   params: Params,
   metrics: &Metrics,
) -> std::result::Result<WriteResult, sqlx::Error> {
   match params {
      Params::Single(values) => {
         metrics.statements_executed.fetch_add(1, Ordering::Relaxed);
         let done = bind_all(query, values).execute(&mut *conn).await?;
         Ok(WriteResult {
            rows_affected: done.rows_affected(),
            last_insert_id: done.last_insert_rowid(),
         })
      }
      Params::Batch(rows) => {
         let mut total = WriteResult::default();
         for values in rows {
            metrics.statements_executed.fetch_add(1, Ordering::Relaxed);
            let done = bind_all(query, values).execute(&mut *conn).await?;
            total.rows_affected += done.rows_affected();
            total.last_insert_id = done.last_insert_rowid();
         }
         Ok(total)
      }
   }
}

async fn rollback(conn: &mut SqliteConnection) {
   if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
      // SQLite may already have rolled the transaction back itself
      warn!(error = %e, "Rollback failed");
   }
}
