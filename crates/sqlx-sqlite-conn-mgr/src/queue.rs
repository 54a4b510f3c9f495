//! Bounded priority write queue

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::priority::OperationPriority;
use crate::value::{Params, WriteResult};
use crate::{Error, Result};

/// A queued write, owned by the queue until its completion handle resolves.
pub(crate) struct WriteOperation {
   pub(crate) seq: u64,
   pub(crate) query: String,
   pub(crate) params: Params,
   pub(crate) priority: OperationPriority,
   pub(crate) enqueued_at: Instant,
   /// Multi-row INSERT built by `execute_batch_insert`
   pub(crate) bulk: bool,
   completion: oneshot::Sender<Result<WriteResult>>,
}

impl WriteOperation {
   /// Resolve the caller's handle. Consumes the operation so it can only
   /// happen once.
   pub(crate) fn resolve(self, result: Result<WriteResult>) {
      if self.completion.send(result).is_err() {
         trace!(seq = self.seq, "Write resolved after caller stopped waiting");
      }
   }

   pub(crate) fn queued_for(&self) -> Duration {
      self.enqueued_at.elapsed()
   }
}

/// Future resolving to the outcome of a submitted write.
///
/// Dropping the handle does not withdraw the write; it still executes with
/// the next batch.
#[must_use = "the write is queued regardless, but its outcome is lost if the handle is dropped"]
pub struct WriteHandle {
   seq: u64,
   rx: oneshot::Receiver<Result<WriteResult>>,
}

impl WriteHandle {
   /// Arrival sequence number of the write
   pub fn seq(&self) -> u64 {
      self.seq
   }
}

impl Future for WriteHandle {
   type Output = Result<WriteResult>;

   fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
      // The sender is only dropped without sending if the manager shut down
      // while the operation was still queued
      Pin::new(&mut self.rx)
         .poll(cx)
         .map(|received| received.unwrap_or(Err(Error::DatabaseClosed)))
   }
}

/// FIFO of pending writes with a hard capacity.
pub(crate) struct WriteQueue {
   ops: Mutex<VecDeque<WriteOperation>>,
   capacity: usize,
   next_seq: AtomicU64,
   /// Only changed while holding `ops`
   closed: AtomicBool,
}

impl WriteQueue {
   pub(crate) fn new(capacity: usize) -> Self {
      Self {
         ops: Mutex::new(VecDeque::new()),
         capacity,
         next_seq: AtomicU64::new(0),
         closed: AtomicBool::new(false),
      }
   }

   /// Admit a write, or reject it if the queue is at capacity. Never blocks
   /// beyond the queue lock.
   pub(crate) fn push(
      &self,
      query: String,
      params: Params,
      priority: OperationPriority,
      bulk: bool,
   ) -> Result<WriteHandle> {
      let mut ops = self.ops.lock();
      if self.closed.load(Ordering::Relaxed) {
         return Err(Error::DatabaseClosed);
      }
      if ops.len() >= self.capacity {
         return Err(Error::QueueFull {
            capacity: self.capacity,
         });
      }

      let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
      let (tx, rx) = oneshot::channel();
      ops.push_back(WriteOperation {
         seq,
         query,
         params,
         priority,
         enqueued_at: Instant::now(),
         bulk,
         completion: tx,
      });

      Ok(WriteHandle { seq, rx })
   }

   /// Take up to `max` operations in arrival order, then stably sort them by
   /// priority, highest first.
   pub(crate) fn pop_batch(&self, max: usize) -> Vec<WriteOperation> {
      let mut batch: Vec<WriteOperation> = {
         let mut ops = self.ops.lock();
         let n = max.min(ops.len());
         ops.drain(..n).collect()
      };
      batch.sort_by_key(|op| std::cmp::Reverse(op.priority));
      batch
   }

   /// Refuse further pushes and hand back everything still queued.
   pub(crate) fn close(&self) -> Vec<WriteOperation> {
      let mut ops = self.ops.lock();
      self.closed.store(true, Ordering::Relaxed);
      ops.drain(..).collect()
   }

   pub(crate) fn len(&self) -> usize {
      self.ops.lock().len()
   }

   pub(crate) fn capacity(&self) -> usize {
      self.capacity
   }
}
