//! Task registry: the single writer of task records.
//!
//! [`TaskRegistry`] creates tasks, enforces one active task per owner, and
//! drives every state transition through
//! [`StateStore::compare_and_set`]. Control calls (pause, resume, abort)
//! come from whichever process handles the owner's request; run calls
//! (start, progress, complete) come from the executor holding the task.
//!
//! # Retry Semantics
//!
//! Each mutation reads the record, validates the change, and writes with
//! CAS. A conflict triggers a re-read and re-validation, up to
//! [`RegistryConfig::cas_retries`] times. A concurrent progress write only
//! bumps the version, so the retry succeeds; a concurrent transition
//! changes the state, so re-validation fails with
//! [`TaskError::InvalidTransition`] and the loser learns what happened.
//!
//! # TTL
//!
//! Every successful write grants the record a fresh TTL and refreshes the
//! owner's slot. A task nobody touches (typically a paused one) lapses and
//! reads as absent afterwards.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::TaskRecord;
use crate::error::TaskError;
use crate::store::StateStore;
use crate::types::{TaskKind, TaskState};

/// Default record lifetime: one day.
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

/// Default number of CAS retries per mutation.
pub const DEFAULT_CAS_RETRIES: u32 = 8;

/// Tunables for [`TaskRegistry`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use xfer_tasks::RegistryConfig;
///
/// let config = RegistryConfig::default();
/// assert_eq!(config.default_ttl, Duration::from_secs(86_400));
/// assert_eq!(config.cas_retries, 8);
/// ```
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lifetime granted to a record and its owner slot by every write.
    pub default_ttl: Duration,

    /// How many times a mutation re-reads and retries after a CAS conflict.
    pub cas_retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            cas_retries: DEFAULT_CAS_RETRIES,
        }
    }
}

/// Creates tasks and performs every state transition.
///
/// Cheap to clone; clones share the store.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use xfer_tasks::{InMemoryStateStore, TaskKind, TaskRegistry, TaskState};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let registry = TaskRegistry::new(Arc::new(InMemoryStateStore::in_memory()));
///
/// let task = registry.create_task("u1", TaskKind::Upload).await.unwrap();
/// assert_eq!(task.state, TaskState::Created);
///
/// let aborted = registry.abort(&task.task_id, "u1").await.unwrap();
/// assert_eq!(aborted.state, TaskState::Aborted);
/// # }
/// ```
#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<dyn StateStore>,
    config: RegistryConfig,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    /// Creates a registry over the given store with default tunables.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            config: RegistryConfig::default(),
        }
    }

    /// Replaces the registry's tunables (builder pattern).
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the registry's tunables.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The underlying state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // ---- Creation ----

    /// Creates a task in the `Created` state and claims the owner's slot.
    ///
    /// The record is written first and the slot claimed second, so a slot
    /// never points at a task that was not written. If the claim is lost
    /// the fresh record is deleted again.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyActive`] if the owner has a task in `Created`,
    ///   `Running` or `Paused`, of any kind.
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    pub async fn create_task(
        &self,
        owner_id: &str,
        kind: TaskKind,
    ) -> Result<TaskRecord, TaskError> {
        let ttl = self.config.default_ttl;
        let record = TaskRecord::new(owner_id.to_string(), kind, ttl);
        let record = self.store.put(&record, ttl).await?;

        if let Err(e) = self.claim_slot(owner_id, &record.task_id).await {
            if let Err(cleanup) = self.store.delete(&record.task_id).await {
                tracing::warn!(
                    task_id = %record.task_id,
                    error = %cleanup,
                    "failed to remove record after losing the owner slot"
                );
            }
            return Err(e);
        }

        tracing::info!(
            task_id = %record.task_id,
            owner_id = owner_id,
            kind = %kind,
            "task created"
        );
        Ok(record)
    }

    async fn claim_slot(&self, owner_id: &str, task_id: &str) -> Result<(), TaskError> {
        let ttl = self.config.default_ttl;
        let mut last_holder = String::new();

        for _ in 0..=self.config.cas_retries {
            let expected = match self.store.active_slot(owner_id).await? {
                None => None,
                Some(slot) => {
                    let holder = self.store.get(&slot.task_id).await?;
                    if holder.as_ref().is_some_and(|h| !h.state.is_terminal()) {
                        return Err(TaskError::AlreadyActive {
                            owner_id: owner_id.to_string(),
                            active_task_id: slot.task_id,
                        });
                    }
                    tracing::warn!(
                        owner_id = owner_id,
                        stale_task_id = %slot.task_id,
                        "replacing stale owner slot"
                    );
                    Some(slot.version)
                },
            };

            match self.store.claim_slot(owner_id, task_id, expected, ttl).await {
                Ok(_) => return Ok(()),
                Err(TaskError::AlreadyActive { active_task_id, .. }) => {
                    tracing::debug!(owner_id = owner_id, "owner slot changed, re-reading");
                    last_holder = active_task_id;
                },
                Err(e) => return Err(e),
            }
        }

        Err(TaskError::AlreadyActive {
            owner_id: owner_id.to_string(),
            active_task_id: last_holder,
        })
    }

    // ---- Reads ----

    /// Returns the task if it exists and belongs to `owner_id`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if the task is absent, lapsed, or owned by
    ///   someone else.
    /// - [`TaskError::Expired`] if the record is past its `expires_at`.
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    pub async fn get(&self, task_id: &str, owner_id: &str) -> Result<TaskRecord, TaskError> {
        self.load(task_id, Some(owner_id)).await
    }

    /// Reads the record as an executor checkpoint sees it.
    ///
    /// Unlike [`get`](Self::get) a miss is not an error: the caller treats
    /// `None` exactly like `Expired`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    pub async fn checkpoint(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        self.store.get(task_id).await
    }

    // ---- Control transitions ----

    /// Pauses a running task.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] unless the task is `Running`.
    /// - [`TaskError::NotFound`] if the task is absent or not the owner's.
    /// - [`TaskError::Conflict`] if CAS retries are exhausted.
    pub async fn pause(&self, task_id: &str, owner_id: &str) -> Result<TaskRecord, TaskError> {
        self.control(task_id, owner_id, TaskState::Paused, &[TaskState::Running])
            .await
    }

    /// Resumes a paused task.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] unless the task is `Paused`.
    /// - [`TaskError::NotFound`] if the task is absent or not the owner's.
    /// - [`TaskError::Conflict`] if CAS retries are exhausted.
    pub async fn resume(&self, task_id: &str, owner_id: &str) -> Result<TaskRecord, TaskError> {
        self.control(task_id, owner_id, TaskState::Running, &[TaskState::Paused])
            .await
    }

    /// Aborts a task that has not settled yet and releases the owner slot.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] if the task is already terminal.
    /// - [`TaskError::NotFound`] if the task is absent or not the owner's.
    /// - [`TaskError::Conflict`] if CAS retries are exhausted.
    pub async fn abort(&self, task_id: &str, owner_id: &str) -> Result<TaskRecord, TaskError> {
        self.control(
            task_id,
            owner_id,
            TaskState::Aborted,
            &[TaskState::Created, TaskState::Running, TaskState::Paused],
        )
        .await
    }

    /// Applies a control request expressed as the desired state.
    ///
    /// `Paused`, `Running` and `Aborted` map to [`pause`](Self::pause),
    /// [`resume`](Self::resume) and [`abort`](Self::abort). Any other state
    /// cannot be requested.
    ///
    /// # Errors
    ///
    /// Same as the mapped operation, plus [`TaskError::InvalidTransition`]
    /// for a state that cannot be requested.
    pub async fn set_state(
        &self,
        task_id: &str,
        owner_id: &str,
        desired: TaskState,
    ) -> Result<TaskRecord, TaskError> {
        match desired {
            TaskState::Paused => self.pause(task_id, owner_id).await,
            TaskState::Running => self.resume(task_id, owner_id).await,
            TaskState::Aborted => self.abort(task_id, owner_id).await,
            TaskState::Created | TaskState::Completed | TaskState::Expired => {
                let current = self.load(task_id, Some(owner_id)).await?;
                Err(TaskError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: current.state,
                    to: desired,
                    suggested_action: Some(
                        "only paused, running and aborted can be requested".to_string(),
                    ),
                })
            },
        }
    }

    async fn control(
        &self,
        task_id: &str,
        owner_id: &str,
        to: TaskState,
        allowed_from: &[TaskState],
    ) -> Result<TaskRecord, TaskError> {
        let written = self
            .mutate(task_id, Some(owner_id), |current| {
                require_edge(current, to, allowed_from)?;
                Ok(TaskRecord {
                    state: to,
                    ..current.clone()
                })
            })
            .await?;

        tracing::info!(
            task_id = task_id,
            owner_id = owner_id,
            state = %written.state,
            "task state changed"
        );
        Ok(written)
    }

    // ---- Run transitions ----

    /// Claims the task for one executor run.
    ///
    /// From `Created` the task moves to `Running`. A `Running` or `Paused`
    /// task with no holder is re-attached without a state change, which is
    /// how a run resumes after a failed one.
    ///
    /// # Errors
    ///
    /// - [`TaskError::KindMismatch`] if the task is of a different kind.
    /// - [`TaskError::AlreadyAssigned`] if another run holds the task.
    /// - [`TaskError::InvalidTransition`] if the task is terminal.
    /// - [`TaskError::NotFound`] if the task is absent or not the owner's.
    pub async fn start(
        &self,
        task_id: &str,
        owner_id: &str,
        kind: TaskKind,
        run_id: &str,
    ) -> Result<TaskRecord, TaskError> {
        let written = self
            .mutate(task_id, Some(owner_id), |current| {
                if current.kind != kind {
                    return Err(TaskError::KindMismatch {
                        task_id: task_id.to_string(),
                        expected: kind,
                        actual: current.kind,
                    });
                }
                if current.run_id.as_deref().is_some_and(|held| held != run_id) {
                    return Err(TaskError::AlreadyAssigned {
                        task_id: task_id.to_string(),
                    });
                }
                let state = match current.state {
                    TaskState::Created => TaskState::Running,
                    TaskState::Running | TaskState::Paused => current.state,
                    settled => {
                        settled.validate_transition(task_id, &TaskState::Running)?;
                        settled
                    },
                };
                Ok(TaskRecord {
                    state,
                    run_id: Some(run_id.to_string()),
                    ..current.clone()
                })
            })
            .await?;

        tracing::info!(
            task_id = task_id,
            run_id = run_id,
            state = %written.state,
            progress = written.progress,
            "run attached"
        );
        Ok(written)
    }

    /// Persists the run's progress cursor.
    ///
    /// Written against whatever state the task is in, so a pause that
    /// landed while the unit was in flight still records the finished unit.
    /// Progress never moves backwards.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyAssigned`] if `run_id` does not hold the task.
    /// - [`TaskError::InvalidTransition`] if the task has settled.
    /// - [`TaskError::NotFound`] if the task lapsed.
    pub async fn record_progress(
        &self,
        task_id: &str,
        run_id: &str,
        progress: u64,
    ) -> Result<TaskRecord, TaskError> {
        let written = self
            .mutate(task_id, None, |current| {
                require_holder(current, run_id)?;
                if current.state.is_terminal() {
                    current
                        .state
                        .validate_transition(task_id, &TaskState::Running)?;
                }
                Ok(TaskRecord {
                    progress: current.progress.max(progress),
                    ..current.clone()
                })
            })
            .await?;

        tracing::debug!(task_id = task_id, progress = written.progress, "progress saved");
        Ok(written)
    }

    /// Marks a running task `Completed` and releases the owner slot.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyAssigned`] if `run_id` does not hold the task.
    /// - [`TaskError::InvalidTransition`] unless the task is `Running`.
    /// - [`TaskError::NotFound`] if the task lapsed.
    pub async fn complete(&self, task_id: &str, run_id: &str) -> Result<TaskRecord, TaskError> {
        let written = self
            .mutate(task_id, None, |current| {
                require_holder(current, run_id)?;
                require_edge(current, TaskState::Completed, &[TaskState::Running])?;
                Ok(TaskRecord {
                    state: TaskState::Completed,
                    run_id: None,
                    ..current.clone()
                })
            })
            .await?;

        tracing::info!(
            task_id = task_id,
            progress = written.progress,
            "task completed"
        );
        Ok(written)
    }

    /// Drops the run's hold on the task so a later run can attach.
    ///
    /// Returns `false` if the task is gone or held by someone else.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    /// - [`TaskError::Conflict`] if CAS retries are exhausted.
    pub async fn release_run(&self, task_id: &str, run_id: &str) -> Result<bool, TaskError> {
        let result = self
            .mutate(task_id, None, |current| {
                require_holder(current, run_id)?;
                Ok(TaskRecord {
                    run_id: None,
                    ..current.clone()
                })
            })
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(task_id = task_id, run_id = run_id, "run released");
                Ok(true)
            },
            Err(
                TaskError::NotFound { .. }
                | TaskError::Expired { .. }
                | TaskError::AlreadyAssigned { .. },
            ) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sweeps lapsed keys from the store.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    pub async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        self.store.cleanup_expired().await
    }

    // ---- Internals ----

    async fn load(&self, task_id: &str, owner_id: Option<&str>) -> Result<TaskRecord, TaskError> {
        let record = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound {
                task_id: task_id.to_string(),
            })?;

        if let Some(owner_id) = owner_id {
            if record.owner_id != owner_id {
                tracing::warn!(
                    task_id = task_id,
                    expected_owner = owner_id,
                    actual_owner = %record.owner_id,
                    "owner mismatch (returning NotFound)"
                );
                return Err(TaskError::NotFound {
                    task_id: task_id.to_string(),
                });
            }
        }

        if record.is_expired() {
            return Err(TaskError::Expired {
                task_id: task_id.to_string(),
            });
        }
        Ok(record)
    }

    /// Read, derive, CAS; retried on conflict with a fresh read each time.
    async fn mutate<F>(
        &self,
        task_id: &str,
        owner_id: Option<&str>,
        mut derive: F,
    ) -> Result<TaskRecord, TaskError>
    where
        F: FnMut(&TaskRecord) -> Result<TaskRecord, TaskError> + Send,
    {
        let ttl = self.config.default_ttl;
        let mut attempt = 0;

        loop {
            let current = self.load(task_id, owner_id).await?;
            let mut next = derive(&current)?;
            next.touch(ttl);

            match self.store.compare_and_set(current.state, &next, ttl).await {
                Ok(written) => {
                    self.sync_slot(&written).await;
                    return Ok(written);
                },
                Err(TaskError::Conflict { .. }) if attempt < self.config.cas_retries => {
                    attempt += 1;
                    tracing::debug!(task_id = task_id, attempt, "CAS conflict, re-reading");
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Keeps the owner slot in step with a freshly written record.
    async fn sync_slot(&self, record: &TaskRecord) {
        let result = if record.state.is_terminal() {
            self.store
                .release_slot(&record.owner_id, &record.task_id)
                .await
        } else {
            self.store
                .refresh_slot(&record.owner_id, &record.task_id, self.config.default_ttl)
                .await
        };

        // A slot left behind is stale and gets replaced by the next create.
        if let Err(e) = result {
            tracing::warn!(
                task_id = %record.task_id,
                owner_id = %record.owner_id,
                error = %e,
                "failed to update owner slot"
            );
        }
    }
}

fn require_edge(
    current: &TaskRecord,
    to: TaskState,
    allowed_from: &[TaskState],
) -> Result<(), TaskError> {
    current.state.validate_transition(&current.task_id, &to)?;
    if allowed_from.contains(&current.state) {
        return Ok(());
    }
    Err(TaskError::InvalidTransition {
        task_id: current.task_id.clone(),
        from: current.state,
        to,
        suggested_action: Some(format!("{to} is not reachable from {}", current.state)),
    })
}

fn require_holder(current: &TaskRecord, run_id: &str) -> Result<(), TaskError> {
    if current.is_held_by(run_id) {
        Ok(())
    } else {
        Err(TaskError::AlreadyAssigned {
            task_id: current.task_id.clone(),
        })
    }
}
