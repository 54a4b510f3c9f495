use std::time::Duration;

use serde::Deserialize;

/// Settings for [`SyncBridgeAdapter`](crate::SyncBridgeAdapter)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
   /// How long a call blocks when the caller passes no timeout
   ///
   /// Default: 30 seconds
   pub default_timeout: Duration,

   /// How long [`stop`](crate::SyncBridgeAdapter::stop) waits for the
   /// scheduler thread to exit before detaching it
   ///
   /// Default: 5 seconds
   pub join_timeout: Duration,

   /// Name of the scheduler thread
   ///
   /// Default: `"sqlite-bridge"`
   pub thread_name: String,
}

impl Default for BridgeConfig {
   fn default() -> Self {
      Self {
         default_timeout: Duration::from_secs(30),
         join_timeout: Duration::from_secs(5),
         thread_name: "sqlite-bridge".to_string(),
      }
   }
}
