use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use sqlx_sqlite_conn_mgr::{
   ConcurrentAccessManager, ConnectionConfig, OperationPriority, Params,
};
use sqlx_sqlite_sync_bridge::{AdapterState, BridgeConfig, BulkInsert, Error, SyncBridgeAdapter};
use tempfile::TempDir;

fn create_adapter(config: ConnectionConfig) -> (SyncBridgeAdapter, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let manager = Arc::new(ConcurrentAccessManager::new(
      temp_dir.path().join("test.db"),
      config,
   ));
   let adapter = SyncBridgeAdapter::new(
      manager,
      BridgeConfig {
         default_timeout: Duration::from_secs(10),
         ..Default::default()
      },
   );
   (adapter, temp_dir)
}

fn fast_flush() -> ConnectionConfig {
   ConnectionConfig {
      write_flush_interval: Duration::from_millis(10),
      ..Default::default()
   }
}

fn create_results_table(adapter: &SyncBridgeAdapter) {
   adapter
      .execute_write(
         "CREATE TABLE results (id INTEGER PRIMARY KEY, horse TEXT NOT NULL, position INTEGER)",
         Params::default(),
         None,
      )
      .unwrap();
}

// ─── Lifecycle ───

#[test]
fn first_call_starts_scheduler() {
   let (adapter, _temp) = create_adapter(fast_flush());
   assert_eq!(adapter.state(), AdapterState::Uninitialized);
   assert!(!adapter.is_healthy());

   let rows = adapter.execute_read("SELECT 1", vec![], None).unwrap();
   assert_eq!(rows[0]["1"], json!(1));

   assert_eq!(adapter.state(), AdapterState::Ready);
   assert!(adapter.is_healthy());
   adapter.stop().unwrap();
}

#[test]
fn concurrent_first_callers_share_one_scheduler() {
   let (adapter, _temp) = create_adapter(fast_flush());
   let adapter = Arc::new(adapter);

   let callers: Vec<_> = (0..8)
      .map(|_| {
         let adapter = Arc::clone(&adapter);
         thread::spawn(move || adapter.execute_read("SELECT 1 AS one", vec![], None))
      })
      .collect();

   for caller in callers {
      let rows = caller.join().unwrap().unwrap();
      assert_eq!(rows[0]["one"], json!(1));
   }
   assert_eq!(adapter.state(), AdapterState::Ready);
   assert!(adapter.manager().is_initialized());
   adapter.stop().unwrap();
}

#[test]
fn stop_is_terminal() {
   let (adapter, _temp) = create_adapter(fast_flush());
   adapter.start().unwrap();

   adapter.stop().unwrap();
   adapter.stop().unwrap();
   assert_eq!(adapter.state(), AdapterState::Stopped);
   assert!(!adapter.is_healthy());

   let err = adapter.execute_read("SELECT 1", vec![], None).unwrap_err();
   assert!(matches!(err, Error::Stopped));
}

#[test]
fn stop_before_start_never_opens_database() {
   let (adapter, temp) = create_adapter(fast_flush());
   adapter.stop().unwrap();

   assert_eq!(adapter.state(), AdapterState::Stopped);
   assert!(!temp.path().join("test.db").exists());
}

// ─── Routing ───

#[test]
fn write_then_read() {
   let (adapter, _temp) = create_adapter(fast_flush());
   create_results_table(&adapter);

   let result = adapter
      .execute_write(
         "INSERT INTO results (horse, position) VALUES ($1, $2)",
         vec![json!("Equinox"), json!(1)],
         None,
      )
      .unwrap();
   assert_eq!(result.rows_affected, 1);

   // Single writes bypass the queue
   assert_eq!(adapter.stats().manager.batches_committed, 0);

   let rows = adapter
      .execute_read("SELECT horse, position FROM results", vec![], None)
      .unwrap();
   assert_eq!(rows[0]["horse"], json!("Equinox"));
   assert_eq!(rows[0]["position"], json!(1));
   adapter.stop().unwrap();
}

#[test]
fn queued_write_uses_batch_flush() {
   let (adapter, _temp) = create_adapter(fast_flush());
   create_results_table(&adapter);

   adapter
      .execute_queued_write(
         "INSERT INTO results (horse) VALUES ($1)",
         vec![json!("Do Deuce")],
         Some(OperationPriority::High),
         None,
      )
      .unwrap();

   assert_eq!(adapter.stats().manager.batches_committed, 1);
   adapter.stop().unwrap();
}

#[test]
fn bulk_insert_both_shapes() {
   let (adapter, _temp) = create_adapter(fast_flush());
   create_results_table(&adapter);

   let inserted = adapter
      .execute_bulk_insert(
         BulkInsert::Table {
            table: "results".into(),
            columns: vec!["horse".into(), "position".into()],
            rows: vec![
               vec![json!("Liberty Island"), json!(1)],
               vec![json!("Stars on Earth"), json!(2)],
               vec![json!("Brede Weg"), json!(3)],
            ],
         },
         None,
         None,
      )
      .unwrap();
   assert_eq!(inserted, 3);

   let inserted = adapter
      .execute_bulk_insert(
         BulkInsert::Statement {
            query: "INSERT INTO results (horse, position) VALUES ($1, $2)".into(),
            rows: vec![
               vec![json!("Harper"), json!(4)],
               vec![json!("Killer Ability"), json!(5)],
            ],
         },
         Some(OperationPriority::Low),
         None,
      )
      .unwrap();
   assert_eq!(inserted, 2);

   let rows = adapter
      .execute_read("SELECT COUNT(*) AS n FROM results", vec![], None)
      .unwrap();
   assert_eq!(rows[0]["n"], json!(5));
   adapter.stop().unwrap();
}

// ─── Timeouts ───

#[test]
fn timed_out_write_is_not_cancelled() {
   let (adapter, temp) = create_adapter(ConnectionConfig {
      write_flush_interval: Duration::from_secs(3600),
      ..Default::default()
   });
   create_results_table(&adapter);

   let err = adapter
      .execute_queued_write(
         "INSERT INTO results (horse) VALUES ($1)",
         vec![json!("Continuous")],
         None,
         Some(Duration::from_millis(50)),
      )
      .unwrap_err();
   assert!(matches!(err, Error::Timeout(_)));
   assert_eq!(adapter.stats().abandoned_writes, 1);
   assert_eq!(adapter.queue_size(), 1);

   // The abandoned write is still flushed on shutdown
   adapter.stop().unwrap();

   let manager = Arc::new(ConcurrentAccessManager::new(
      temp.path().join("test.db"),
      ConnectionConfig::default(),
   ));
   let reopened = SyncBridgeAdapter::new(manager, BridgeConfig::default());
   let rows = reopened
      .execute_read("SELECT horse FROM results", vec![], None)
      .unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0]["horse"], json!("Continuous"));
   reopened.stop().unwrap();
}

#[test]
fn timed_out_read_is_cancelled() {
   let (adapter, _temp) = create_adapter(fast_flush());
   adapter.start().unwrap();

   let slow = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 3000000) \
               SELECT COUNT(*) AS n FROM c";
   let err = adapter
      .execute_read(slow, vec![], Some(Duration::from_millis(1)))
      .unwrap_err();

   assert!(matches!(err, Error::Timeout(_)));
   assert!(err.is_retryable());
   assert_eq!(adapter.stats().cancelled_reads, 1);

   // The adapter keeps serving calls afterwards
   let rows = adapter.execute_read("SELECT 2 AS two", vec![], None).unwrap();
   assert_eq!(rows[0]["two"], json!(2));
   adapter.stop().unwrap();
}

#[test]
fn manager_errors_pass_through() {
   let (adapter, _temp) = create_adapter(fast_flush());
   let err = adapter
      .execute_write("INSERT INTO missing VALUES (1)", Params::default(), None)
      .unwrap_err();

   assert!(matches!(
      err,
      Error::Manager(sqlx_sqlite_conn_mgr::Error::WriteExecution(_))
   ));
   assert_eq!(err.error_code(), "WRITE_EXECUTION_ERROR");
   adapter.stop().unwrap();
}
