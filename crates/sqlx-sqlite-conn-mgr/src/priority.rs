//! Write scheduling priority

use serde::{Deserialize, Serialize};

/// Priority of a queued write.
///
/// Within one flush batch, higher priorities execute first; operations with
/// equal priority keep their arrival order.
#[derive(
   Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OperationPriority {
   Low,
   #[default]
   Normal,
   High,
   Critical,
}
