//! Owner slot -- the per-owner pointer to the single active task.

use serde::{Deserialize, Serialize};

/// Points at the task currently occupying an owner's active slot.
///
/// Claimed with a version-guarded insert, so two concurrent creations for
/// the same owner cannot both succeed. A slot whose task is missing or
/// terminal is stale and may be replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSlot {
    /// The task holding the slot.
    pub task_id: String,

    /// Backend version the slot was read at; never serialized.
    #[serde(skip)]
    pub version: u64,
}

impl ActiveSlot {
    /// Creates an unversioned slot pointing at `task_id`.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            version: 0,
        }
    }
}
