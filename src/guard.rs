//! Scoped ownership of a run's resources.
//!
//! A [`ResourceGuard`] owns everything one executor run opened (file
//! handles, buffers, staging directories) together with the run's
//! [`RunTracker`] registration. Dropping the guard, explicitly through
//! [`ResourceGuard::release`] or implicitly when the run future is dropped
//! or unwinds, closes the resources first and then frees the registration.
//!
//! Once the run holds its task, the guard also carries a [`RunLease`]. A
//! run that ends normally drops the lease through the registry itself; a
//! run that is dropped hands the release to the runtime so the task can be
//! resumed without waiting for its TTL.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use xfer_tasks::{TaskError, TaskKind, TaskRegistry};

/// What the tracker knows about a live local run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    /// The executor run identifier.
    pub run_id: String,
    /// What the run transfers.
    pub kind: TaskKind,
    /// When the run registered.
    pub started_at: DateTime<Utc>,
}

/// Process-local view of the runs executing in this process.
///
/// This is not task state: it only lets the process refuse a second local
/// run of a task and report how many runs still hold resources. Cloning
/// shares the same map.
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    runs: Arc<DashMap<String, RunInfo>>,
}

impl RunTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run of `task_id`.
    ///
    /// # Errors
    ///
    /// [`TaskError::AlreadyAssigned`] if this process already runs the task.
    pub fn register(
        &self,
        task_id: &str,
        run_id: &str,
        kind: TaskKind,
    ) -> Result<RunRegistration, TaskError> {
        match self.runs.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(TaskError::AlreadyAssigned {
                task_id: task_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(RunInfo {
                    run_id: run_id.to_string(),
                    kind,
                    started_at: Utc::now(),
                });
                Ok(RunRegistration {
                    runs: Arc::clone(&self.runs),
                    task_id: task_id.to_string(),
                    run_id: run_id.to_string(),
                    released: false,
                })
            },
        }
    }

    /// Number of runs currently holding resources.
    pub fn active_count(&self) -> usize {
        self.runs.len()
    }

    /// Returns `true` if a local run of the task holds resources.
    pub fn is_running(&self, task_id: &str) -> bool {
        self.runs.contains_key(task_id)
    }

    /// Snapshot of a local run.
    pub fn get(&self, task_id: &str) -> Option<RunInfo> {
        self.runs.get(task_id).map(|info| info.clone())
    }
}

/// A run's entry in the [`RunTracker`]; removes it on drop.
#[derive(Debug)]
pub struct RunRegistration {
    runs: Arc<DashMap<String, RunInfo>>,
    task_id: String,
    run_id: String,
    released: bool,
}

impl RunRegistration {
    /// The registered task.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The registered run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.runs
            .remove_if(&self.task_id, |_, info| info.run_id == self.run_id);
        if self.released {
            tracing::debug!(task_id = %self.task_id, run_id = %self.run_id, "run resources released");
        } else {
            tracing::warn!(
                task_id = %self.task_id,
                run_id = %self.run_id,
                "run dropped without explicit release, resources reclaimed"
            );
        }
    }
}

/// A run's hold on its task record.
///
/// Dropped unsettled, it spawns a `release_run` on the current runtime.
#[derive(Debug)]
pub struct RunLease {
    registry: TaskRegistry,
    task_id: String,
    run_id: String,
    settled: bool,
}

impl RunLease {
    /// Tracks the hold `run_id` took on `task_id`.
    pub fn new(registry: TaskRegistry, task_id: &str, run_id: &str) -> Self {
        Self {
            registry,
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
            settled: false,
        }
    }

    /// Marks the hold as already dropped or cleared in the store.
    pub fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                task_id = %self.task_id,
                run_id = %self.run_id,
                "no runtime to drop run lease, it lapses with the task"
            );
            return;
        };

        let registry = self.registry.clone();
        let task_id = std::mem::take(&mut self.task_id);
        let run_id = std::mem::take(&mut self.run_id);
        runtime.spawn(async move {
            match registry.release_run(&task_id, &run_id).await {
                Ok(released) => {
                    tracing::info!(task_id = %task_id, released, "lease of dropped run handed back");
                },
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to drop lease of dropped run");
                },
            }
        });
    }
}

/// Owns a run's resources, its store lease and its tracker registration.
///
/// Derefs to the owned resource. Field order is drop order: the resource
/// closes first, then the lease is handed back, then the registration is
/// removed, so [`RunTracker`] never reports a run as gone while its handles
/// are still open.
#[derive(Debug)]
pub struct ResourceGuard<T> {
    resource: T,
    lease: Option<RunLease>,
    registration: RunRegistration,
}

impl<T> ResourceGuard<T> {
    /// Takes ownership of `resource` for the registered run.
    pub fn new(resource: T, registration: RunRegistration) -> Self {
        Self {
            resource,
            lease: None,
            registration,
        }
    }

    /// Attaches the store lease the run took when it started.
    pub fn hold_lease(&mut self, lease: RunLease) {
        self.lease = Some(lease);
    }

    /// The run this guard belongs to.
    pub fn run_id(&self) -> &str {
        self.registration.run_id()
    }

    /// Releases every resource now. The caller has already settled the
    /// lease with the store.
    pub fn release(mut self) {
        if let Some(lease) = self.lease.as_mut() {
            lease.settle();
        }
        self.registration.released = true;
    }
}

impl<T> Deref for ResourceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> DerefMut for ResourceGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.resource
    }
}
