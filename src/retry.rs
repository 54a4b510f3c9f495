//! Exponential backoff for legacy reads that hit a busy database

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::Result;

/// How often and how patiently a failed call is retried
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
   /// Retries after the first attempt
   pub max_retries: u32,
   /// Delay before the first retry
   pub initial_delay: Duration,
   /// Upper bound for any single delay
   pub max_delay: Duration,
   /// Growth factor between consecutive delays
   pub multiplier: f64,
}

impl Default for RetryConfig {
   fn default() -> Self {
      Self {
         max_retries: 3,
         initial_delay: Duration::from_millis(100),
         max_delay: Duration::from_secs(2),
         multiplier: 2.0,
      }
   }
}

impl RetryConfig {
   /// No retries at all
   pub fn none() -> Self {
      Self {
         max_retries: 0,
         ..Default::default()
      }
   }

   /// Delay to wait after the given zero-based failed attempt
   pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
      let exponent = attempt.min(i32::MAX as u32) as i32;
      let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
      if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
         return self.max_delay;
      }
      Duration::from_millis(delay_ms as u64)
   }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of retries. The last error is returned.
pub(crate) async fn retry<T, F, Fut>(
   config: &RetryConfig,
   operation_name: &str,
   mut operation: F,
) -> Result<T>
where
   F: FnMut() -> Fut,
   Fut: Future<Output = Result<T>>,
{
   let mut attempt = 0;
   loop {
      match operation().await {
         Ok(result) => {
            if attempt > 0 {
               debug!(operation = operation_name, retries = attempt, "Succeeded after retry");
            }
            return Ok(result);
         }
         Err(e) if attempt < config.max_retries && e.is_retryable() => {
            let delay = config.delay_for_attempt(attempt);
            warn!(
               operation = operation_name,
               attempt = attempt + 1,
               max_attempts = config.max_retries + 1,
               delay_ms = delay.as_millis() as u64,
               error = %e,
               "Retrying"
            );
            sleep(delay).await;
            attempt += 1;
         }
         Err(e) => return Err(e),
      }
   }
}
