//! Single entry point that picks the optimized or legacy path per call

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx_sqlite_conn_mgr::{
   ConcurrentAccessManager, ConnectionConfig, OperationPriority, Params, Row, WriteResult,
};
use sqlx_sqlite_sync_bridge::{AdapterState, BridgeConfig, BulkInsert, SyncBridgeAdapter};
use tracing::{debug, warn};

use crate::legacy::{LegacyAccess, LegacyConfig};
use crate::{Error, Result};

/// Which path serves calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
   /// Access manager through the blocking bridge, legacy path as fallback
   #[default]
   Optimized,
   /// File-locked direct connections only
   Legacy,
}

/// Health reported in [`PerformanceStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
   /// Optimized path not started yet
   Idle,
   Healthy,
   Unhealthy,
   Stopped,
}

/// Everything needed to build an [`AccessCoordinator`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
   pub mode: AccessMode,
   pub connection: ConnectionConfig,
   pub bridge: BridgeConfig,
   pub legacy: LegacyConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
   pub pool_size: u32,
   pub queue_depth: usize,
   pub batch_size: usize,
   pub flush_interval: Duration,
   pub mode: AccessMode,
   pub status: Status,
   /// Calls the optimized path failed and the legacy path retried
   pub fallbacks: u64,
}

/// Front door for database access from synchronous code.
///
/// In [`AccessMode::Optimized`] every call goes through a
/// [`SyncBridgeAdapter`] first. If the adapter fails, the call is logged,
/// counted and retried once through the file-locked legacy path. Writes that
/// timed out are the exception: the manager may still commit them, so they
/// are reported instead of run a second time.
///
/// After [`stop`](Self::stop) the adapter is gone for good and calls are
/// served by the legacy path.
pub struct AccessCoordinator {
   path: PathBuf,
   mode: AccessMode,
   adapter: Option<SyncBridgeAdapter>,
   legacy: LegacyAccess,
   fallbacks: AtomicU64,
}

impl AccessCoordinator {
   /// Nothing is opened until the first call or [`start`](Self::start).
   pub fn new(path: impl AsRef<Path>, config: CoordinatorConfig) -> Result<Self> {
      let path = path.as_ref().to_path_buf();
      config.connection.validate()?;

      let legacy = LegacyAccess::new(&path, &config.connection, config.legacy)?;
      let adapter = match config.mode {
         AccessMode::Optimized => {
            let manager = Arc::new(ConcurrentAccessManager::new(&path, config.connection));
            Some(SyncBridgeAdapter::new(manager, config.bridge))
         }
         AccessMode::Legacy => None,
      };

      debug!(path = %path.display(), mode = ?config.mode, "Coordinator created");

      Ok(Self {
         path,
         mode: config.mode,
         adapter,
         legacy,
         fallbacks: AtomicU64::new(0),
      })
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn mode(&self) -> AccessMode {
      self.mode
   }

   /// The optimized path, if this coordinator has one
   pub fn adapter(&self) -> Option<&SyncBridgeAdapter> {
      self.adapter.as_ref()
   }

   /// Calls served by the legacy path after the adapter failed
   pub fn fallback_count(&self) -> u64 {
      self.fallbacks.load(Ordering::Relaxed)
   }

   pub fn execute_read(&self, query: &str, params: Vec<JsonValue>) -> Result<Vec<Row>> {
      self.dispatch(
         "read",
         false,
         |adapter| adapter.execute_read(query, params.clone(), None),
         |legacy| legacy.execute_read(query, params.clone()),
      )
   }

   pub fn execute_write(&self, query: &str, params: impl Into<Params>) -> Result<WriteResult> {
      let params = params.into();
      self.dispatch(
         "write",
         true,
         |adapter| adapter.execute_write(query, params.clone(), None),
         |legacy| legacy.execute_write(query, params.clone()),
      )
   }

   /// Queue the write for the next batch, ordered by `priority` within it
   pub fn execute_write_with_priority(
      &self,
      query: &str,
      params: impl Into<Params>,
      priority: OperationPriority,
   ) -> Result<WriteResult> {
      let params = params.into();
      self.dispatch(
         "queued write",
         true,
         |adapter| adapter.execute_queued_write(query, params.clone(), Some(priority), None),
         |legacy| legacy.execute_write(query, params.clone()),
      )
   }

   /// Returns the number of rows inserted
   pub fn execute_bulk_insert(
      &self,
      bulk: BulkInsert,
      priority: Option<OperationPriority>,
   ) -> Result<u64> {
      self.dispatch(
         "bulk insert",
         true,
         |adapter| adapter.execute_bulk_insert(bulk.clone(), priority, None),
         |legacy| legacy.execute_bulk_insert(bulk.clone()),
      )
   }

   pub fn execute_immediate_write(
      &self,
      query: &str,
      params: impl Into<Params>,
   ) -> Result<WriteResult> {
      let params = params.into();
      self.dispatch(
         "immediate write",
         true,
         |adapter| adapter.execute_immediate_write(query, params.clone(), None),
         |legacy| legacy.execute_write(query, params.clone()),
      )
   }

   /// Open the database now instead of on the first call
   pub fn start(&self) -> Result<()> {
      match &self.adapter {
         Some(adapter) => Ok(adapter.start()?),
         None => Ok(()),
      }
   }

   /// Flush queued writes and shut the optimized path down
   pub fn stop(&self) -> Result<()> {
      match &self.adapter {
         Some(adapter) => Ok(adapter.stop()?),
         None => Ok(()),
      }
   }

   /// Legacy mode opens nothing ahead of time, so it always reports healthy
   pub fn is_healthy(&self) -> bool {
      match &self.adapter {
         Some(adapter) => adapter.is_healthy(),
         None => true,
      }
   }

   pub fn queue_size(&self) -> usize {
      self.adapter.as_ref().map_or(0, SyncBridgeAdapter::queue_size)
   }

   pub fn performance_stats(&self) -> PerformanceStats {
      let fallbacks = self.fallback_count();
      let Some(adapter) = &self.adapter else {
         return PerformanceStats {
            pool_size: 1,
            queue_depth: 0,
            batch_size: 1,
            flush_interval: Duration::ZERO,
            mode: self.mode,
            status: Status::Healthy,
            fallbacks,
         };
      };

      let config = adapter.manager().config();
      let status = match adapter.state() {
         AdapterState::Uninitialized | AdapterState::Initializing => Status::Idle,
         AdapterState::Stopped => Status::Stopped,
         AdapterState::Ready if adapter.is_healthy() => Status::Healthy,
         AdapterState::Ready => Status::Unhealthy,
      };

      PerformanceStats {
         pool_size: config.reader_pool_size,
         queue_depth: adapter.queue_size(),
         batch_size: config.write_batch_size,
         flush_interval: config.write_flush_interval,
         mode: self.mode,
         status,
         fallbacks,
      }
   }

   fn dispatch<T>(
      &self,
      operation: &'static str,
      is_write: bool,
      optimized: impl FnOnce(&SyncBridgeAdapter) -> sqlx_sqlite_sync_bridge::Result<T>,
      legacy: impl FnOnce(&LegacyAccess) -> Result<T>,
   ) -> Result<T> {
      let Some(adapter) = &self.adapter else {
         return legacy(&self.legacy);
      };

      match optimized(adapter) {
         Ok(value) => Ok(value),
         Err(e @ sqlx_sqlite_sync_bridge::Error::Timeout(_)) if is_write => {
            warn!(operation, error = %e, "Optimized write timed out; not retrying");
            Err(Error::Bridge(e))
         }
         Err(e) => {
            let fallbacks = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
               operation,
               error = %e,
               code = %e.error_code(),
               fallbacks,
               "Optimized path failed; using legacy path"
            );
            legacy(&self.legacy)
         }
      }
   }
}

impl Drop for AccessCoordinator {
   fn drop(&mut self) {
      if let Some(adapter) = &self.adapter
         && adapter.state() == AdapterState::Ready
         && let Err(e) = adapter.stop()
      {
         warn!(error = %e, "Failed to stop optimized path on drop");
      }
   }
}
