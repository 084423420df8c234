//! Task record -- the store's representation of one transfer task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{TaskKind, TaskState};

/// Authoritative state of a transfer task, as held by the state store.
///
/// `task_id`, `owner_id`, `kind` and `created_at` never change after
/// creation. `state` only moves along the edges of [`TaskState`].
/// `progress` counts completed units of work and never decreases.
///
/// Executors only ever hold a snapshot of this record; they must re-read it
/// at every checkpoint instead of trusting a cached copy.
///
/// # Construction
///
/// ```
/// use std::time::Duration;
/// use xfer_tasks::{TaskKind, TaskRecord, TaskState};
///
/// let record = TaskRecord::new("u1".to_string(), TaskKind::Upload, Duration::from_secs(60));
/// assert!(!record.task_id.is_empty());
/// assert_eq!(record.state, TaskState::Created);
/// assert_eq!(record.progress, 0);
/// assert_eq!(record.ttl_seconds, 60);
/// assert!(record.expires_at.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Unique identifier, generated at creation and never reused.
    pub task_id: String,

    /// The user that created the task.
    pub owner_id: String,

    /// What the task transfers.
    pub kind: TaskKind,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Number of completed units (chunks or deleted items). The resume cursor.
    pub progress: u64,

    /// Identifier of the executor run currently holding the task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,

    /// Lifetime granted by the last write, in seconds.
    pub ttl_seconds: u64,

    /// `updated_at + ttl_seconds`. `None` if the sum overflows.
    pub expires_at: Option<DateTime<Utc>>,

    /// Backend version of the bytes this record was read from. Used by
    /// compare-and-set; never serialized.
    #[serde(skip)]
    pub version: u64,
}

impl TaskRecord {
    /// Creates a new record in the `Created` state with a `UUIDv4` task ID.
    pub fn new(owner_id: String, kind: TaskKind, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            owner_id,
            kind,
            state: TaskState::Created,
            progress: 0,
            run_id: None,
            created_at: now,
            updated_at: now,
            ttl_seconds: ttl.as_secs(),
            expires_at: expiry_after(now, ttl),
            version: 0,
        }
    }

    /// Stamps the record as written now with a fresh lifetime of `ttl`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use xfer_tasks::{TaskKind, TaskRecord};
    ///
    /// let mut record = TaskRecord::new("u1".to_string(), TaskKind::Delete, Duration::from_secs(5));
    /// record.touch(Duration::from_secs(3600));
    /// assert_eq!(record.ttl_seconds, 3600);
    /// assert!(record.updated_at >= record.created_at);
    /// ```
    pub fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.updated_at = now;
        self.ttl_seconds = ttl.as_secs();
        self.expires_at = expiry_after(now, ttl);
    }

    /// Returns `true` if the wall clock is past `expires_at`.
    ///
    /// Advisory only: the store enforces TTL on its own clock and a lapsed
    /// record is normally never returned at all.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expiry| Utc::now() > expiry)
    }

    /// Returns `true` if the given executor run currently holds the task.
    pub fn is_held_by(&self, run_id: &str) -> bool {
        self.run_id.as_deref() == Some(run_id)
    }
}

/// Checked `now + ttl`; overflow yields `None` instead of a panic.
fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(ttl)
}
