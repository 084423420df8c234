//! State store trait, generic implementation, and storage backends.
//!
//! # Architecture
//!
//! The state storage system has three layers:
//!
//! 1. **[`StateStore`]** -- A type-erasure interface for use with
//!    `Arc<dyn StateStore>` in [`TaskRegistry`](crate::registry::TaskRegistry).
//!
//! 2. **[`GenericStateStore<B>`](generic::GenericStateStore)** -- Typed
//!    records, JSON serialization, state-and-version CAS and owner slots.
//!    Has a blanket `StateStore` impl.
//!
//! 3. **[`StorageBackend`]** -- Dumb versioned KV trait with per-key TTL
//!    that backends implement. No domain logic.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](crate::store::memory::InMemoryBackend) -- `DashMap`
//!   backend for tests and single-process use.
//! - [`RedisBackend`](crate::store::redis::RedisBackend) -- Redis backend
//!   shared by every server process. Available behind the `redis` feature.

pub mod backend;
pub mod generic;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use backend::{StorageBackend, StorageError, VersionedRecord};

use crate::domain::{ActiveSlot, TaskRecord};
use crate::error::TaskError;
use crate::types::TaskState;

/// Shared, time-bounded store of task records and owner slots.
///
/// Every operation is atomic for the single key it touches; there are no
/// multi-key transactions. TTL is store-enforced: once a key's lifetime
/// elapses it reads as absent, which callers must treat exactly like an
/// explicit `Expired` state.
///
/// Backend failures surface as [`TaskError::StoreUnavailable`], never as a
/// silent success or an empty read.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store is shared by the
/// registry and every executor in the process.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Writes a record unconditionally and returns it with its new version.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn put(&self, record: &TaskRecord, ttl: Duration) -> Result<TaskRecord, TaskError>;

    /// Reads a record. `Ok(None)` is a miss: never created, deleted, or
    /// lapsed.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Corrupted`] if the stored bytes do not decode.
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError>;

    /// Writes `record` only if the stored copy is in `expected_state` and at
    /// `record.version`. Returns the written record with its new version.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if the record is absent.
    /// - [`TaskError::Conflict`] if the state or the version changed.
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn compare_and_set(
        &self,
        expected_state: TaskState,
        record: &TaskRecord,
        ttl: Duration,
    ) -> Result<TaskRecord, TaskError>;

    /// Deletes a record. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn delete(&self, task_id: &str) -> Result<bool, TaskError>;

    /// Reads the owner's active slot.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn active_slot(&self, owner_id: &str) -> Result<Option<ActiveSlot>, TaskError>;

    /// Points the owner's slot at `task_id`, replacing the slot read at
    /// version `expected` (`None`: the owner must have no slot).
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyActive`] if the slot changed since it was read.
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn claim_slot(
        &self,
        owner_id: &str,
        task_id: &str,
        expected: Option<u64>,
        ttl: Duration,
    ) -> Result<ActiveSlot, TaskError>;

    /// Extends the slot's TTL if it still points at `task_id`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn refresh_slot(
        &self,
        owner_id: &str,
        task_id: &str,
        ttl: Duration,
    ) -> Result<bool, TaskError>;

    /// Clears the slot if it still points at `task_id`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn release_slot(&self, owner_id: &str, task_id: &str) -> Result<bool, TaskError>;

    /// Removes lapsed keys. Best effort; returns how many were removed.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    async fn cleanup_expired(&self) -> Result<usize, TaskError>;
}

// ---- Blanket impl for GenericStateStore<B> ----

#[async_trait]
impl<B: StorageBackend + 'static> StateStore for generic::GenericStateStore<B> {
    async fn put(&self, record: &TaskRecord, ttl: Duration) -> Result<TaskRecord, TaskError> {
        self.put(record, ttl).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        self.get(task_id).await
    }

    async fn compare_and_set(
        &self,
        expected_state: TaskState,
        record: &TaskRecord,
        ttl: Duration,
    ) -> Result<TaskRecord, TaskError> {
        self.compare_and_set(expected_state, record, ttl).await
    }

    async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        self.delete(task_id).await
    }

    async fn active_slot(&self, owner_id: &str) -> Result<Option<ActiveSlot>, TaskError> {
        self.active_slot(owner_id).await
    }

    async fn claim_slot(
        &self,
        owner_id: &str,
        task_id: &str,
        expected: Option<u64>,
        ttl: Duration,
    ) -> Result<ActiveSlot, TaskError> {
        self.claim_slot(owner_id, task_id, expected, ttl).await
    }

    async fn refresh_slot(
        &self,
        owner_id: &str,
        task_id: &str,
        ttl: Duration,
    ) -> Result<bool, TaskError> {
        self.refresh_slot(owner_id, task_id, ttl).await
    }

    async fn release_slot(&self, owner_id: &str, task_id: &str) -> Result<bool, TaskError> {
        self.release_slot(owner_id, task_id).await
    }

    async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        self.cleanup_expired().await
    }
}
