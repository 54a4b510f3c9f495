//! Exclusive advisory lock on a sidecar `<db>.lock` file
//!
//! Serializes legacy connections across threads and processes. Each
//! acquisition opens its own handle, so two acquisitions inside one process
//! exclude each other just as two processes do.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::{Error, Result};

/// Path of the lock file that guards `db_path`
pub fn lock_path_for(db_path: &Path) -> PathBuf {
   let mut name = db_path.as_os_str().to_owned();
   name.push(".lock");
   PathBuf::from(name)
}

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct AdvisoryLock {
   file: File,
   path: PathBuf,
}

impl AdvisoryLock {
   /// Poll for the lock every `poll_interval` until it is free or `timeout`
   /// has passed.
   pub fn acquire(path: &Path, poll_interval: Duration, timeout: Duration) -> Result<Self> {
      let file = OpenOptions::new()
         .read(true)
         .write(true)
         .create(true)
         .truncate(false)
         .open(path)?;

      let start = Instant::now();
      loop {
         match file.try_lock() {
            Ok(()) => {
               trace!(path = %path.display(), waited_ms = start.elapsed().as_millis() as u64, "Lock acquired");
               return Ok(Self {
                  file,
                  path: path.to_path_buf(),
               });
            }
            Err(TryLockError::WouldBlock) => {}
            Err(TryLockError::Error(e)) => return Err(Error::Io(e)),
         }

         let waited = start.elapsed();
         if waited >= timeout {
            warn!(path = %path.display(), waited_ms = waited.as_millis() as u64, "Lock timeout");
            return Err(Error::LockTimeout {
               path: path.to_path_buf(),
               waited,
            });
         }
         thread::sleep(poll_interval.min(timeout - waited));
      }
   }

   pub fn path(&self) -> &Path {
      &self.path
   }
}

impl Drop for AdvisoryLock {
   fn drop(&mut self) {
      if let Err(e) = self.file.unlock() {
         warn!(path = %self.path.display(), error = %e, "Failed to release lock");
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use tempfile::TempDir;

   #[test]
   fn test_lock_path_appends_suffix() {
      assert_eq!(
         lock_path_for(Path::new("/data/betting.db")),
         PathBuf::from("/data/betting.db.lock")
      );
   }

   #[test]
   fn test_second_acquire_times_out_while_held() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("races.db.lock");

      let held = AdvisoryLock::acquire(&path, Duration::from_millis(5), Duration::from_secs(1)).unwrap();
      let err = AdvisoryLock::acquire(&path, Duration::from_millis(5), Duration::from_millis(40))
         .unwrap_err();

      match err {
         Error::LockTimeout { path: p, waited } => {
            assert_eq!(p, path);
            assert!(waited >= Duration::from_millis(40));
         }
         other => panic!("expected LockTimeout, got {other:?}"),
      }

      drop(held);
      AdvisoryLock::acquire(&path, Duration::from_millis(5), Duration::from_millis(40)).unwrap();
   }

   #[test]
   fn test_waiter_gets_lock_once_released() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("races.db.lock");

      let held = AdvisoryLock::acquire(&path, Duration::from_millis(5), Duration::from_secs(1)).unwrap();
      let waiter_path = path.clone();
      let waiter = thread::spawn(move || {
         AdvisoryLock::acquire(&waiter_path, Duration::from_millis(5), Duration::from_secs(5))
            .map(|lock| lock.path().to_path_buf())
      });

      thread::sleep(Duration::from_millis(50));
      drop(held);

      assert_eq!(waiter.join().unwrap().unwrap(), path);
   }
}
