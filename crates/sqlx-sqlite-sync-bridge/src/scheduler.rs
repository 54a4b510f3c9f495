//! Dedicated thread running the runtime that all bridged work executes on

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{Error, Result};

/// A current-thread runtime driven by its own OS thread.
///
/// Tasks spawned through [`Scheduler::handle`] keep running for as long as
/// the thread is alive, including the access manager's flush loop.
pub(crate) struct Scheduler {
   handle: Handle,
   shutdown: Option<oneshot::Sender<()>>,
   exited: mpsc::Receiver<()>,
   thread: Option<JoinHandle<()>>,
}

impl Scheduler {
   pub(crate) fn spawn(thread_name: &str) -> Result<Self> {
      let (ready_tx, ready_rx) = mpsc::sync_channel(1);
      let (exit_tx, exited) = mpsc::sync_channel(1);
      let (shutdown, shutdown_rx) = oneshot::channel::<()>();

      let thread = std::thread::Builder::new()
         .name(thread_name.to_string())
         .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
               .enable_all()
               .build()
            {
               Ok(rt) => rt,
               Err(e) => {
                  let _ = ready_tx.send(Err(e));
                  return;
               }
            };

            let _ = ready_tx.send(Ok(runtime.handle().clone()));

            // Resolves on an explicit stop and when the Scheduler is dropped
            runtime.block_on(async {
               let _ = shutdown_rx.await;
            });

            // Tasks still pending are cancelled here
            drop(runtime);
            let _ = exit_tx.send(());
         })?;

      let handle = ready_rx
         .recv()
         .map_err(|_| Error::TaskFailed("scheduler thread exited during startup".into()))??;

      debug!(thread = thread_name, "Scheduler started");

      Ok(Self {
         handle,
         shutdown: Some(shutdown),
         exited,
         thread: Some(thread),
      })
   }

   pub(crate) fn handle(&self) -> &Handle {
      &self.handle
   }

   /// Signal the runtime to exit and wait up to `join_timeout` for the
   /// thread. A thread that does not exit in time is detached.
   pub(crate) fn shutdown(mut self, join_timeout: Duration) {
      if let Some(shutdown) = self.shutdown.take() {
         let _ = shutdown.send(());
      }

      match self.exited.recv_timeout(join_timeout) {
         Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if let Some(thread) = self.thread.take()
               && thread.join().is_err()
            {
               warn!("Scheduler thread panicked");
            }
            debug!("Scheduler stopped");
         }
         Err(RecvTimeoutError::Timeout) => {
            warn!(
               timeout_ms = join_timeout.as_millis() as u64,
               "Scheduler thread did not exit in time; detaching"
            );
         }
      }
   }
}
