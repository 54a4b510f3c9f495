//! access-bench - concurrent load against the legacy and optimized paths
//!
//! Creates a scratch table, then runs writer and reader threads through one
//! `AccessCoordinator` per mode and reports throughput.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use betting_db_access::{
   AccessCoordinator, AccessMode, CoordinatorConfig, OperationPriority, Params,
};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "access-bench", about = "Compare legacy and optimized database access")]
struct Cli {
   /// Database file to create or reuse
   #[arg(long, default_value = "access-bench.db")]
   db: PathBuf,

   /// Which path to exercise
   #[arg(long, value_enum, default_value_t = BenchMode::Both)]
   mode: BenchMode,

   /// Threads issuing writes
   #[arg(long, default_value_t = 4)]
   writers: usize,

   /// Threads issuing reads
   #[arg(long, default_value_t = 8)]
   readers: usize,

   /// Operations per thread
   #[arg(long, default_value_t = 200)]
   ops: usize,

   /// Send writes through the batch queue instead of the immediate path
   #[arg(long)]
   queued: bool,

   /// Enable debug logging (RUST_LOG takes precedence)
   #[arg(long)]
   debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BenchMode {
   Legacy,
   Optimized,
   Both,
}

struct Report {
   mode: AccessMode,
   elapsed: Duration,
   operations: usize,
   fallbacks: u64,
}

fn main() -> Result<()> {
   let cli = Cli::parse();
   init_tracing(cli.debug)?;

   let modes: &[AccessMode] = match cli.mode {
      BenchMode::Legacy => &[AccessMode::Legacy],
      BenchMode::Optimized => &[AccessMode::Optimized],
      BenchMode::Both => &[AccessMode::Legacy, AccessMode::Optimized],
   };

   let mut reports = Vec::with_capacity(modes.len());
   for &mode in modes {
      reports.push(run(&cli, mode)?);
   }

   for report in &reports {
      let secs = report.elapsed.as_secs_f64();
      println!(
         "{:<10} {:>8} ops in {:>8.3}s  {:>10.1} ops/sec  {} fallbacks",
         format!("{:?}", report.mode).to_lowercase(),
         report.operations,
         secs,
         report.operations as f64 / secs.max(f64::EPSILON),
         report.fallbacks,
      );
   }

   if let [legacy, optimized] = reports.as_slice() {
      let speedup =
         legacy.elapsed.as_secs_f64() / optimized.elapsed.as_secs_f64().max(f64::EPSILON);
      println!("optimized speedup: {speedup:.2}x");
   }

   Ok(())
}

fn init_tracing(debug: bool) -> Result<()> {
   let default = if debug { "debug" } else { "info" };
   let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

   tracing_subscriber::fmt()
      .with_env_filter(filter)
      .compact()
      .try_init()
      .map_err(|err| anyhow!(err))
}

fn run(cli: &Cli, mode: AccessMode) -> Result<Report> {
   let db = Arc::new(
      AccessCoordinator::new(
         &cli.db,
         CoordinatorConfig {
            mode,
            ..Default::default()
         },
      )
      .with_context(|| format!("failed to open {}", cli.db.display()))?,
   );
   prepare(&db, &cli.db)?;

   info!(
      mode = ?mode,
      writers = cli.writers,
      readers = cli.readers,
      ops = cli.ops,
      "Starting run"
   );
   let start = Instant::now();

   let mut threads = Vec::with_capacity(cli.writers + cli.readers);
   for writer in 0..cli.writers {
      let db = Arc::clone(&db);
      let (ops, queued) = (cli.ops, cli.queued);
      threads.push(thread::spawn(move || -> Result<()> {
         for i in 0..ops {
            let params = vec![json!(format!("w{writer}-{i}")), json!(i as f64 * 0.5)];
            if queued {
               db.execute_write_with_priority(
                  "INSERT INTO bench_odds (runner, price) VALUES ($1, $2)",
                  params,
                  OperationPriority::Normal,
               )?;
            } else {
               db.execute_write(
                  "INSERT INTO bench_odds (runner, price) VALUES ($1, $2)",
                  params,
               )?;
            }
         }
         Ok(())
      }));
   }
   for _ in 0..cli.readers {
      let db = Arc::clone(&db);
      let ops = cli.ops;
      threads.push(thread::spawn(move || -> Result<()> {
         for _ in 0..ops {
            db.execute_read("SELECT COUNT(*) AS n, MAX(price) AS top FROM bench_odds", vec![])?;
         }
         Ok(())
      }));
   }

   for thread in threads {
      thread
         .join()
         .map_err(|_| anyhow!("benchmark thread panicked"))??;
   }

   let elapsed = start.elapsed();
   let fallbacks = db.fallback_count();
   db.stop()?;

   Ok(Report {
      mode,
      elapsed,
      operations: cli.ops * (cli.writers + cli.readers),
      fallbacks,
   })
}

fn prepare(db: &AccessCoordinator, path: &Path) -> Result<()> {
   db.execute_immediate_write(
      "CREATE TABLE IF NOT EXISTS bench_odds (id INTEGER PRIMARY KEY, runner TEXT NOT NULL, price REAL)",
      Params::default(),
   )
   .with_context(|| format!("failed to create scratch table in {}", path.display()))?;
   db.execute_immediate_write("DELETE FROM bench_odds", Params::default())?;
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;
   use tracing::level_filters::{LevelFilter, STATIC_MAX_LEVEL};

   #[test]
   fn debug_events_are_compiled_in() {
      assert!(STATIC_MAX_LEVEL >= LevelFilter::DEBUG);
   }

   #[test]
   fn parses_debug_flag() {
      let cli = Cli::parse_from(["access-bench", "--debug", "--mode", "optimized"]);
      assert!(cli.debug);
      assert_eq!(cli.mode, BenchMode::Optimized);
   }
}
