//! Generic state store with typed records over a [`StorageBackend`].
//!
//! [`GenericStateStore`] turns the backend's opaque versioned bytes into
//! [`TaskRecord`]s and [`ActiveSlot`]s: JSON serialization at the storage
//! boundary, state-and-version compare-and-set, owner slot bookkeeping, and
//! mapping of raw [`StorageError`]s into [`TaskError`]s.
//!
//! Backends remain dumb key-value stores; the state machine itself lives
//! one layer up in [`TaskRegistry`](crate::registry::TaskRegistry).
//!
//! # CAS Semantics
//!
//! [`compare_and_set`](GenericStateStore::compare_and_set) reads the stored
//! record, checks that it is still in the expected state **and** at the
//! version the caller read, then writes with
//! [`StorageBackend::put_if_version`]. A concurrent writer that slips in
//! between surfaces as [`TaskError::Conflict`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{ActiveSlot, TaskRecord};
use crate::error::TaskError;
use crate::store::backend::{owner_key, task_key, StorageBackend, StorageError};
use crate::types::TaskState;

/// State store that delegates all storage to a [`StorageBackend`].
///
/// # Type Parameters
///
/// * `B` - A [`StorageBackend`] implementation (in-memory, Redis, ...)
#[derive(Debug)]
pub struct GenericStateStore<B: StorageBackend> {
    backend: B,
}

impl<B: StorageBackend> GenericStateStore<B> {
    /// Creates a state store over the given backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns a reference to the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ---- Serialization helpers (private) ----

    fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(value).map_err(|e| TaskError::Corrupted {
            key: key.to_string(),
            message: format!("failed to serialize: {e}"),
        })
    }

    fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T, TaskError> {
        serde_json::from_slice(data).map_err(|e| TaskError::Corrupted {
            key: key.to_string(),
            message: format!("failed to deserialize: {e}"),
        })
    }

    fn unavailable(err: StorageError) -> TaskError {
        match err {
            StorageError::Backend { message, source } => {
                TaskError::StoreUnavailable { message, source }
            },
            other => TaskError::StoreUnavailable {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    // ---- Task records ----

    /// Writes a record unconditionally with the given TTL.
    ///
    /// Returns the record stamped with its new version.
    pub async fn put(&self, record: &TaskRecord, ttl: Duration) -> Result<TaskRecord, TaskError> {
        let key = task_key(&record.task_id);
        let bytes = Self::encode(&key, record)?;
        let version = self
            .backend
            .put(&key, &bytes, ttl)
            .await
            .map_err(Self::unavailable)?;
        Ok(TaskRecord {
            version,
            ..record.clone()
        })
    }

    /// Reads a record. `None` means the key is absent or its TTL lapsed.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        let key = task_key(task_id);
        match self.backend.get(&key).await {
            Ok(versioned) => {
                let mut record: TaskRecord = Self::decode(&key, &versioned.data)?;
                record.version = versioned.version;
                Ok(Some(record))
            },
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::unavailable(e)),
        }
    }

    /// Replaces a record only if the stored copy is still in
    /// `expected_state` and at `record.version`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if the record is absent or lapsed.
    /// - [`TaskError::Conflict`] if the state or version moved on. `actual`
    ///   carries the state found, so callers can tell a version-only race
    ///   (`actual == expected`) from a lost transition.
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    pub async fn compare_and_set(
        &self,
        expected_state: TaskState,
        record: &TaskRecord,
        ttl: Duration,
    ) -> Result<TaskRecord, TaskError> {
        let task_id = record.task_id.as_str();
        let current = self.get(task_id).await?.ok_or_else(|| TaskError::NotFound {
            task_id: task_id.to_string(),
        })?;

        if current.state != expected_state || current.version != record.version {
            return Err(TaskError::Conflict {
                task_id: task_id.to_string(),
                expected: expected_state,
                actual: Some(current.state),
            });
        }

        let key = task_key(task_id);
        let bytes = Self::encode(&key, record)?;
        match self
            .backend
            .put_if_version(&key, &bytes, record.version, ttl)
            .await
        {
            Ok(version) => Ok(TaskRecord {
                version,
                ..record.clone()
            }),
            Err(StorageError::NotFound { .. }) => Err(TaskError::NotFound {
                task_id: task_id.to_string(),
            }),
            Err(StorageError::VersionConflict { .. }) => {
                let actual = self.get(task_id).await?.map(|r| r.state);
                Err(TaskError::Conflict {
                    task_id: task_id.to_string(),
                    expected: expected_state,
                    actual,
                })
            },
            Err(e) => Err(Self::unavailable(e)),
        }
    }

    /// Deletes a record. Returns `true` if it existed.
    pub async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        self.backend
            .delete(&task_key(task_id))
            .await
            .map_err(Self::unavailable)
    }

    // ---- Owner slots ----

    /// Reads the owner's active slot, if any.
    pub async fn active_slot(&self, owner_id: &str) -> Result<Option<ActiveSlot>, TaskError> {
        let key = owner_key(owner_id);
        match self.backend.get(&key).await {
            Ok(versioned) => {
                let mut slot: ActiveSlot = Self::decode(&key, &versioned.data)?;
                slot.version = versioned.version;
                Ok(Some(slot))
            },
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::unavailable(e)),
        }
    }

    /// Points the owner's slot at `task_id`.
    ///
    /// `expected` is the version of the slot being replaced, or `None` to
    /// require that the owner has no slot at all.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyActive`] if the slot changed since it was read.
    ///   `active_task_id` names the current holder, or is empty if the slot
    ///   vanished in the meantime.
    /// - [`TaskError::StoreUnavailable`] on backend failures.
    pub async fn claim_slot(
        &self,
        owner_id: &str,
        task_id: &str,
        expected: Option<u64>,
        ttl: Duration,
    ) -> Result<ActiveSlot, TaskError> {
        let key = owner_key(owner_id);
        let slot = ActiveSlot::new(task_id);
        let bytes = Self::encode(&key, &slot)?;
        match self
            .backend
            .put_if_version(&key, &bytes, expected.unwrap_or(0), ttl)
            .await
        {
            Ok(version) => Ok(ActiveSlot { version, ..slot }),
            Err(StorageError::NotFound { .. } | StorageError::VersionConflict { .. }) => {
                let active_task_id = self
                    .active_slot(owner_id)
                    .await?
                    .map(|s| s.task_id)
                    .unwrap_or_default();
                Err(TaskError::AlreadyActive {
                    owner_id: owner_id.to_string(),
                    active_task_id,
                })
            },
            Err(e) => Err(Self::unavailable(e)),
        }
    }

    /// Extends the slot's TTL if it still points at `task_id`.
    ///
    /// Returns `false` if the slot is gone or belongs to another task.
    pub async fn refresh_slot(
        &self,
        owner_id: &str,
        task_id: &str,
        ttl: Duration,
    ) -> Result<bool, TaskError> {
        let Some(slot) = self.active_slot(owner_id).await? else {
            return Ok(false);
        };
        if slot.task_id != task_id {
            return Ok(false);
        }
        let key = owner_key(owner_id);
        let bytes = Self::encode(&key, &slot)?;
        match self
            .backend
            .put_if_version(&key, &bytes, slot.version, ttl)
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. } | StorageError::VersionConflict { .. }) => Ok(false),
            Err(e) => Err(Self::unavailable(e)),
        }
    }

    /// Clears the owner's slot if it still points at `task_id`.
    ///
    /// Returns `false` if the slot is gone or belongs to another task.
    pub async fn release_slot(&self, owner_id: &str, task_id: &str) -> Result<bool, TaskError> {
        let Some(slot) = self.active_slot(owner_id).await? else {
            return Ok(false);
        };
        if slot.task_id != task_id {
            return Ok(false);
        }
        match self
            .backend
            .delete_if_version(&owner_key(owner_id), slot.version)
            .await
        {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound { .. } | StorageError::VersionConflict { .. }) => Ok(false),
            Err(e) => Err(Self::unavailable(e)),
        }
    }

    /// Sweeps expired keys from the backend.
    pub async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        self.backend
            .cleanup_expired()
            .await
            .map_err(Self::unavailable)
    }
}
