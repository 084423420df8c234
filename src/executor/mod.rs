//! The cooperative transfer loop.
//!
//! A [`TransferExecutor`] drives one [`ChunkOperation`] for one task. It
//! claims the task in the registry, resumes from the persisted progress,
//! and between staging and applying each unit re-reads the task record.
//! That checkpoint is the only way a run learns about pause, resume, abort
//! or expiry: nothing interrupts a unit in flight.
//!
//! Every exit path goes through the run's [`ResourceGuard`], so handles,
//! buffers and staging directories are released whether the run completes,
//! is cancelled, fails, or is dropped. A dropped run also hands its lease
//! on the task back to the store.

pub mod delete;
pub mod download;
pub mod operation;
pub mod upload;

use std::future::Future;
use std::io;
use std::time::Duration;

use uuid::Uuid;
use xfer_tasks::{TaskError, TaskRegistry, TaskState};

pub use delete::DeleteOperation;
pub use download::{Delivery, DownloadOperation};
pub use operation::{CancelReason, ChunkOperation, TransferOutcome};
pub use upload::UploadOperation;

use crate::error::{Error, Result};
use crate::guard::{ResourceGuard, RunLease, RunTracker};

/// Default bytes per upload or download unit.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Default interval between checkpoints while paused.
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_secs(2);

/// Executor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Bytes per upload or download unit.
    pub chunk_size: usize,
    /// How long a paused run sleeps between checkpoints.
    pub pause_poll_interval: Duration,
    /// Attempts per state store call before failing safe. At least one.
    pub store_retry_attempts: u32,
    /// Delay before the first retry; doubles after each attempt.
    pub store_retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pause_poll_interval: DEFAULT_PAUSE_POLL,
            store_retry_attempts: 5,
            store_retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Result of a checkpoint.
enum Gate {
    Proceed,
    Stop(CancelReason),
}

/// Runs chunk operations against tasks held in a [`TaskRegistry`].
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    registry: TaskRegistry,
    tracker: RunTracker,
    config: ExecutorConfig,
}

impl TransferExecutor {
    /// Creates an executor with default tuning.
    pub fn new(registry: TaskRegistry, tracker: RunTracker) -> Self {
        Self {
            registry,
            tracker,
            config: ExecutorConfig::default(),
        }
    }

    /// Replaces the tuning.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Current tuning.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs tracked by this executor's process.
    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Runs `operation` for the task until it completes or stops.
    ///
    /// Returns `Ok(Cancelled)` when the task was aborted, expired, taken
    /// over, or the store stayed unreachable. In every one of those cases
    /// the run's resources are released before returning.
    ///
    /// # Errors
    ///
    /// - [`Error::Task`] if the task cannot be claimed: unknown, not the
    ///   owner's, of another kind, settled, or held by another run.
    /// - [`Error::TransferFailed`] if chunk I/O fails. The record keeps its
    ///   progress and a later run resumes from there.
    pub async fn run<Op>(&self, task_id: &str, owner_id: &str, operation: Op) -> Result<TransferOutcome>
    where
        Op: ChunkOperation,
    {
        let run_id = Uuid::new_v4().to_string();
        let kind = operation.kind();
        let registration = self.tracker.register(task_id, &run_id, kind)?;
        let mut guard = ResourceGuard::new(operation, registration);

        let record = match self
            .retrying("start", task_id, || self.registry.start(task_id, owner_id, kind, &run_id))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                guard.release();
                return Err(e.into());
            },
        };
        guard.hold_lease(RunLease::new(self.registry.clone(), task_id, &run_id));

        let mut progress = record.progress;
        tracing::info!(
            task_id = task_id,
            run_id = %run_id,
            kind = %kind,
            progress = progress,
            "run started"
        );

        if let Err(e) = guard.prepare(progress).await {
            return self.fail(guard, task_id, progress, e).await;
        }

        loop {
            let unit = match guard.next_unit().await {
                Ok(Some(unit)) => unit,
                Ok(None) => break,
                Err(e) => return self.fail(guard, task_id, progress, e).await,
            };

            if let Gate::Stop(reason) = self.checkpoint(task_id, &run_id).await {
                return Ok(self.cancel(guard, task_id, reason, progress).await);
            }

            if let Err(e) = guard.apply(unit).await {
                return self.fail(guard, task_id, progress, e).await;
            }

            let next = progress + 1;
            match self
                .retrying("progress", task_id, || {
                    self.registry.record_progress(task_id, &run_id, next)
                })
                .await
            {
                Ok(record) => progress = record.progress,
                Err(e) => {
                    let reason = stop_reason(task_id, &e);
                    return Ok(self.cancel(guard, task_id, reason, progress).await);
                },
            }
        }

        if let Err(e) = guard.finish().await {
            return self.fail(guard, task_id, progress, e).await;
        }

        // A pause that lands after the last unit still holds completion.
        if let Gate::Stop(reason) = self.checkpoint(task_id, &run_id).await {
            return Ok(self.cancel(guard, task_id, reason, progress).await);
        }

        match self
            .retrying("complete", task_id, || self.registry.complete(task_id, &run_id))
            .await
        {
            Ok(record) => {
                guard.release();
                tracing::info!(task_id = task_id, progress = record.progress, "run completed");
                Ok(TransferOutcome::Completed {
                    progress: record.progress,
                })
            },
            Err(e) => {
                let reason = stop_reason(task_id, &e);
                Ok(self.cancel(guard, task_id, reason, progress).await)
            },
        }
    }

    /// Re-reads the task until it is running (proceed) or can never run
    /// again for this run (stop). Waits while paused.
    async fn checkpoint(&self, task_id: &str, run_id: &str) -> Gate {
        loop {
            let record = match self
                .retrying("checkpoint", task_id, || self.registry.checkpoint(task_id))
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => return Gate::Stop(CancelReason::Expired),
                Err(e) => return Gate::Stop(stop_reason(task_id, &e)),
            };

            match record.state {
                TaskState::Aborted => return Gate::Stop(CancelReason::Aborted),
                TaskState::Expired => return Gate::Stop(CancelReason::Expired),
                TaskState::Created | TaskState::Completed => {
                    return Gate::Stop(CancelReason::Superseded)
                },
                TaskState::Running | TaskState::Paused if !record.is_held_by(run_id) => {
                    return Gate::Stop(CancelReason::Superseded)
                },
                TaskState::Running => return Gate::Proceed,
                TaskState::Paused => {
                    tracing::debug!(
                        task_id = task_id,
                        progress = record.progress,
                        "paused, holding resources"
                    );
                    tokio::time::sleep(self.config.pause_poll_interval).await;
                },
            }
        }
    }

    /// Calls the store, retrying retryable failures with exponential
    /// backoff.
    async fn retrying<T, F, Fut>(&self, op: &'static str, task_id: &str, mut call: F) -> std::result::Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TaskError>>,
    {
        let attempts = self.config.store_retry_attempts.max(1);
        let mut delay = self.config.store_retry_backoff;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        task_id = task_id,
                        op = op,
                        attempt = attempt,
                        error = %e,
                        "state store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                },
                result => return result,
            }
        }
    }

    async fn cancel<Op>(
        &self,
        mut guard: ResourceGuard<Op>,
        task_id: &str,
        reason: CancelReason,
        progress: u64,
    ) -> TransferOutcome
    where
        Op: ChunkOperation,
    {
        guard.abandon(reason).await;
        self.release_run(task_id, guard.run_id()).await;
        guard.release();

        if reason == CancelReason::StoreUnavailable {
            tracing::warn!(task_id = task_id, progress = progress, "state store unreachable, run cancelled");
        } else {
            tracing::info!(task_id = task_id, reason = %reason, progress = progress, "run cancelled");
        }
        TransferOutcome::Cancelled { reason, progress }
    }

    async fn fail<Op>(
        &self,
        guard: ResourceGuard<Op>,
        task_id: &str,
        progress: u64,
        source: io::Error,
    ) -> Result<TransferOutcome>
    where
        Op: ChunkOperation,
    {
        tracing::warn!(task_id = task_id, progress = progress, error = %source, "transfer failed");
        self.release_run(task_id, guard.run_id()).await;
        guard.release();
        Err(Error::TransferFailed {
            task_id: task_id.to_string(),
            progress,
            source,
        })
    }

    /// Drops the run's hold so a later run can attach. Best effort.
    async fn release_run(&self, task_id: &str, run_id: &str) {
        match self.registry.release_run(task_id, run_id).await {
            Ok(released) => {
                tracing::debug!(task_id = task_id, released = released, "run lease dropped");
            },
            Err(e) => {
                tracing::warn!(task_id = task_id, error = %e, "failed to drop run lease");
            },
        }
    }
}

/// What a registry failure during a run means for the run.
fn stop_reason(task_id: &str, error: &TaskError) -> CancelReason {
    let reason = match error {
        TaskError::StoreUnavailable { .. } | TaskError::Conflict { .. } => {
            CancelReason::StoreUnavailable
        },
        TaskError::NotFound { .. }
        | TaskError::Expired { .. }
        | TaskError::InvalidTransition {
            from: TaskState::Expired,
            ..
        } => CancelReason::Expired,
        TaskError::InvalidTransition {
            from: TaskState::Aborted,
            ..
        } => CancelReason::Aborted,
        TaskError::InvalidTransition { .. }
        | TaskError::AlreadyActive { .. }
        | TaskError::AlreadyAssigned { .. }
        | TaskError::KindMismatch { .. }
        | TaskError::Corrupted { .. } => CancelReason::Superseded,
    };
    tracing::debug!(task_id = task_id, error = %error, reason = %reason, "run stopped by the registry");
    reason
}
