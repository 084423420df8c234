//! The unit-of-work contract the executor drives.

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use xfer_tasks::TaskKind;

/// Why a run stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The owner aborted the task.
    Aborted,
    /// The task's TTL lapsed, or its record is gone.
    Expired,
    /// The state store stayed unreachable after every retry.
    StoreUnavailable,
    /// Another run took over or settled the task.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::Expired => write!(f, "expired"),
            Self::StoreUnavailable => write!(f, "store unavailable"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// How a run ended, when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransferOutcome {
    /// All units were applied and the task is `Completed`.
    Completed {
        /// Units applied over the task's lifetime.
        progress: u64,
    },
    /// The run stopped early and released its resources.
    Cancelled {
        /// What stopped it.
        reason: CancelReason,
        /// Last persisted progress.
        progress: u64,
    },
}

impl TransferOutcome {
    /// Units applied over the task's lifetime.
    pub fn progress(&self) -> u64 {
        match self {
            Self::Completed { progress } | Self::Cancelled { progress, .. } => *progress,
        }
    }

    /// Returns `true` for [`TransferOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// One kind of chunked transfer.
///
/// The executor calls `prepare` once, then alternates `next_unit` and
/// `apply` until `next_unit` yields `None`, then calls `finish`. A unit is
/// staged before the checkpoint so that a paused run already holds its next
/// chunk, and applied only after the checkpoint saw `Running`. Each applied
/// unit advances the persisted progress by exactly one.
#[async_trait]
pub trait ChunkOperation: Send {
    /// A staged unit of work.
    type Unit: Send;

    /// The task kind this operation runs.
    fn kind(&self) -> TaskKind;

    /// Positions the operation after `progress` applied units.
    async fn prepare(&mut self, progress: u64) -> io::Result<()>;

    /// Stages the next unit, or `None` when the work is exhausted.
    async fn next_unit(&mut self) -> io::Result<Option<Self::Unit>>;

    /// Applies one staged unit.
    async fn apply(&mut self, unit: Self::Unit) -> io::Result<()>;

    /// Flushes and commits after the last unit.
    async fn finish(&mut self) -> io::Result<()>;

    /// Undoes what a cancelled run leaves behind. Best effort; failures are
    /// logged, not returned.
    async fn abandon(&mut self, reason: CancelReason);
}
