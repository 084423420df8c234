//! Error types for task lifecycle operations.
//!
//! Provides [`TaskError`], the coordination error taxonomy shared by the
//! state store, the registry, and the transfer executor. Every variant
//! carries the identifiers needed to log or report it, and
//! [`status_code`](TaskError::status_code) maps it to the HTTP status a
//! boundary layer should answer with.

use std::fmt;

use crate::types::kind::TaskKind;
use crate::types::state::TaskState;

/// Errors that can occur while coordinating a transfer task.
///
/// # Examples
///
/// ```
/// use xfer_tasks::TaskError;
///
/// let err = TaskError::NotFound {
///     task_id: "missing-task".to_string(),
/// };
/// assert_eq!(err.status_code(), 404);
/// assert!(err.to_string().contains("missing-task"));
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug)]
pub enum TaskError {
    /// The requested state change is not an edge of the state machine.
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: String,
        /// The state the task was in.
        from: TaskState,
        /// The state that was rejected.
        to: TaskState,
        /// Optional hint for the caller.
        suggested_action: Option<String>,
    },

    /// A compare-and-set lost a race against a concurrent writer.
    ///
    /// `actual` is `None` when the record disappeared between read and
    /// write.
    Conflict {
        /// The contested task.
        task_id: String,
        /// The state the writer expected.
        expected: TaskState,
        /// The state found in the store, if any.
        actual: Option<TaskState>,
    },

    /// No task with this ID is visible to the caller.
    NotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// The task's TTL lapsed.
    Expired {
        /// The expired task's ID.
        task_id: String,
    },

    /// The owner already has a task in a non-terminal state.
    AlreadyActive {
        /// The owner that tried to create a second task.
        owner_id: String,
        /// The task currently holding the owner's active slot.
        active_task_id: String,
    },

    /// Another executor run already holds this task.
    AlreadyAssigned {
        /// The task ID.
        task_id: String,
    },

    /// A run of one kind was requested for a task of another kind.
    KindMismatch {
        /// The task ID.
        task_id: String,
        /// The kind the run needs.
        expected: TaskKind,
        /// The kind the task was created with.
        actual: TaskKind,
    },

    /// The state store could not be reached.
    StoreUnavailable {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A stored value could not be decoded.
    Corrupted {
        /// The store key holding the bad value.
        key: String,
        /// Decoder message.
        message: String,
    },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition {
                task_id, from, to, ..
            } => write!(
                f,
                "invalid transition from {from} to {to} for task {task_id}"
            ),
            Self::Conflict {
                task_id,
                expected,
                actual,
            } => match actual {
                Some(actual) => write!(
                    f,
                    "conflicting update on task {task_id}: expected {expected}, found {actual}"
                ),
                None => write!(
                    f,
                    "conflicting update on task {task_id}: expected {expected}, record is gone"
                ),
            },
            Self::NotFound { task_id } => write!(f, "task not found: {task_id}"),
            Self::Expired { task_id } => write!(f, "task expired: {task_id}"),
            Self::AlreadyActive {
                owner_id,
                active_task_id,
            } => write!(
                f,
                "owner {owner_id} already has an active task: {active_task_id}"
            ),
            Self::AlreadyAssigned { task_id } => {
                write!(f, "task {task_id} is already assigned to a running transfer")
            },
            Self::KindMismatch {
                task_id,
                expected,
                actual,
            } => write!(
                f,
                "task {task_id} is a {actual} task, cannot run it as {expected}"
            ),
            Self::StoreUnavailable { message, .. } => {
                write!(f, "state store unavailable: {message}")
            },
            Self::Corrupted { key, message } => {
                write!(f, "corrupted record at {key}: {message}")
            },
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::StoreUnavailable {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

impl TaskError {
    /// Maps this error to the HTTP status a boundary layer should return.
    ///
    /// - `404`: `NotFound`, `Expired`
    /// - `409`: `InvalidTransition`, `Conflict`, `AlreadyActive`,
    ///   `AlreadyAssigned`, `KindMismatch`
    /// - `503`: `StoreUnavailable`
    /// - `500`: `Corrupted`
    ///
    /// # Examples
    ///
    /// ```
    /// use xfer_tasks::{TaskError, TaskState};
    ///
    /// let err = TaskError::InvalidTransition {
    ///     task_id: "t1".to_string(),
    ///     from: TaskState::Paused,
    ///     to: TaskState::Paused,
    ///     suggested_action: None,
    /// };
    /// assert_eq!(err.status_code(), 409);
    /// ```
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } | Self::Expired { .. } => 404,
            Self::InvalidTransition { .. }
            | Self::Conflict { .. }
            | Self::AlreadyActive { .. }
            | Self::AlreadyAssigned { .. }
            | Self::KindMismatch { .. } => 409,
            Self::StoreUnavailable { .. } => 503,
            Self::Corrupted { .. } => 500,
        }
    }

    /// Returns `true` if re-reading state and trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::StoreUnavailable { .. })
    }

    /// Returns `true` if the task is gone for good (absent or lapsed).
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Expired { .. })
    }
}
