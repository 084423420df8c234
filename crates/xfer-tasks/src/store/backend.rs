//! Low-level key-value storage backend trait and supporting types.
//!
//! The [`StorageBackend`] trait is the contract every cache engine
//! implements: versioned reads, unconditional and version-guarded writes
//! with a per-key TTL, guarded deletes, and an optional expiry sweep.
//!
//! Domain logic (state machine validation, owner slots, serialization) does
//! **not** belong here. Backends are dumb KV stores; domain logic lives in
//! [`GenericStateStore`](crate::store::generic::GenericStateStore).
//!
//! # Key Structure
//!
//! | Key | Value |
//! |-----|-------|
//! | `task:{task_id}` | serialized `TaskRecord` |
//! | `owner:{owner_id}` | serialized `ActiveSlot` |
//!
//! # Versioning
//!
//! Each stored value carries a monotonic `u64` version starting at 1,
//! incremented on every successful write. Version `0` never exists, so
//! [`put_if_version`](StorageBackend::put_if_version) with an expected
//! version of `0` means "only if the key is absent".
//!
//! # TTL
//!
//! Every write carries a TTL. Once it elapses the key reads as
//! [`StorageError::NotFound`], whatever copies other processes hold.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Prefix of task record keys.
pub const TASK_KEY_PREFIX: &str = "task:";

/// Prefix of owner slot keys.
pub const OWNER_KEY_PREFIX: &str = "owner:";

/// A stored value paired with its monotonic version number.
///
/// # Examples
///
/// ```
/// use xfer_tasks::store::backend::VersionedRecord;
///
/// let record = VersionedRecord {
///     data: b"{}".to_vec(),
///     version: 1,
/// };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// The serialized value bytes (JSON).
    pub data: Vec<u8>,

    /// Monotonic version number. Starts at 1.
    pub version: u64,
}

/// Errors that can occur during raw storage operations.
///
/// `GenericStateStore` maps them to [`TaskError`](crate::error::TaskError)
/// variants before surfacing to callers.
///
/// # Examples
///
/// ```
/// use xfer_tasks::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "task:t1".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The key is absent or its TTL elapsed.
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A guarded write or delete found a different version.
    VersionConflict {
        /// The key where the conflict occurred.
        key: String,
        /// The version the caller expected (`0` = absent).
        expected: u64,
        /// The version found (`0` = absent).
        actual: u64,
    },

    /// The backend could not be reached or failed internally.
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Versioned key-value store with per-key TTL.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one backend is shared by every
/// registry and executor in the process.
///
/// # Atomicity
///
/// Each method is atomic for its key. No multi-key transactions are
/// offered or needed.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value and its version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key is absent or expired.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a value unconditionally with a fresh TTL and returns its new
    /// version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn put(&self, key: &str, data: &[u8], ttl: Duration) -> Result<u64, StorageError>;

    /// Stores a value only if the current version equals `expected_version`.
    ///
    /// An `expected_version` of `0` succeeds only when the key is absent.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if `expected_version > 0` and the key is
    ///   absent.
    /// - [`StorageError::VersionConflict`] if the stored version differs.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        ttl: Duration,
    ) -> Result<u64, StorageError>;

    /// Deletes a key. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Deletes a key only if its version equals `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key is absent.
    /// - [`StorageError::VersionConflict`] if the stored version differs.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn delete_if_version(&self, key: &str, expected_version: u64)
        -> Result<(), StorageError>;

    /// Removes expired keys. Returns how many were removed.
    ///
    /// Best effort: reads already hide expired keys, so callers never rely
    /// on this for correctness. Backends with native expiry return `0`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn cleanup_expired(&self) -> Result<usize, StorageError>;
}

/// Builds the key holding a task record.
///
/// # Examples
///
/// ```
/// use xfer_tasks::store::backend::task_key;
///
/// assert_eq!(task_key("abc-123"), "task:abc-123");
/// ```
pub fn task_key(task_id: &str) -> String {
    format!("{TASK_KEY_PREFIX}{task_id}")
}

/// Builds the key holding an owner's active slot.
///
/// # Examples
///
/// ```
/// use xfer_tasks::store::backend::owner_key;
///
/// assert_eq!(owner_key("u1@example.com"), "owner:u1@example.com");
/// ```
pub fn owner_key(owner_id: &str) -> String {
    format!("{OWNER_KEY_PREFIX}{owner_id}")
}
