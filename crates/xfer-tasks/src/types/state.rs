//! Task lifecycle states and the transition table between them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TaskError;

/// Lifecycle state of a transfer task.
///
/// # State Machine
///
/// ```text
/// Created -> Running (start), Aborted, Expired
/// Running -> Paused (pause), Completed, Aborted, Expired
/// Paused  -> Running (resume), Aborted, Expired
/// Aborted, Completed, Expired -> (terminal, no transitions)
/// ```
///
/// `Expired` is store-driven: a record whose TTL lapsed is simply absent,
/// and readers treat the absence as this state.
///
/// # Examples
///
/// ```
/// use xfer_tasks::TaskState;
///
/// let state = TaskState::Running;
/// assert!(state.is_active());
/// assert!(state.can_transition_to(&TaskState::Paused));
/// assert!(!state.can_transition_to(&TaskState::Running)); // self-transition rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Task exists but no executor has started it.
    Created,
    /// An executor is moving bytes.
    Running,
    /// The owner paused the task; the executor holds its resources and waits.
    Paused,
    /// The owner aborted the task (terminal).
    Aborted,
    /// The executor finished every unit of work (terminal).
    Completed,
    /// The TTL lapsed (terminal).
    Expired,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Aborted => write!(f, "aborted"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl TaskState {
    /// All states, in declaration order.
    pub const ALL: [TaskState; 6] = [
        Self::Created,
        Self::Running,
        Self::Paused,
        Self::Aborted,
        Self::Completed,
        Self::Expired,
    ];

    /// Returns `true` if no further transitions are allowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use xfer_tasks::TaskState;
    ///
    /// assert!(!TaskState::Created.is_terminal());
    /// assert!(!TaskState::Paused.is_terminal());
    /// assert!(TaskState::Aborted.is_terminal());
    /// assert!(TaskState::Completed.is_terminal());
    /// assert!(TaskState::Expired.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Completed | Self::Expired)
    }

    /// Returns `true` for the states that occupy the owner's single active
    /// slot (`Created`, `Running`, `Paused`).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns `true` if moving from this state to `next` is an edge of the
    /// state machine. Self-transitions are never edges.
    ///
    /// # Examples
    ///
    /// ```
    /// use xfer_tasks::TaskState;
    ///
    /// assert!(TaskState::Created.can_transition_to(&TaskState::Running));
    /// assert!(TaskState::Paused.can_transition_to(&TaskState::Running));
    /// assert!(!TaskState::Created.can_transition_to(&TaskState::Paused));
    /// assert!(!TaskState::Paused.can_transition_to(&TaskState::Completed));
    /// assert!(!TaskState::Aborted.can_transition_to(&TaskState::Running));
    /// ```
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }

        match self {
            Self::Created => matches!(next, Self::Running | Self::Aborted | Self::Expired),
            Self::Running => matches!(
                next,
                Self::Paused | Self::Completed | Self::Aborted | Self::Expired
            ),
            Self::Paused => matches!(next, Self::Running | Self::Aborted | Self::Expired),
            Self::Aborted | Self::Completed | Self::Expired => false,
        }
    }

    /// Validates a transition from this state to `next`.
    ///
    /// Returns a [`TaskError::InvalidTransition`] carrying a hint when the
    /// edge does not exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use xfer_tasks::TaskState;
    ///
    /// assert!(TaskState::Running
    ///     .validate_transition("task-123", &TaskState::Paused)
    ///     .is_ok());
    /// assert!(TaskState::Paused
    ///     .validate_transition("task-123", &TaskState::Paused)
    ///     .is_err());
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        let suggested_action = if self.is_terminal() {
            Some(format!("task is already settled ({self})"))
        } else if self == next {
            Some(format!("task is already {self}"))
        } else {
            None
        };

        Err(TaskError::InvalidTransition {
            task_id: task_id.to_string(),
            from: *self,
            to: *next,
            suggested_action,
        })
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}
