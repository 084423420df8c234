//! In-memory storage backend.
//!
//! [`InMemoryBackend`] provides a thread-safe [`StorageBackend`] over
//! `DashMap`. It is a dumb KV store with no domain logic, used for tests and
//! single-process deployments. Multi-process deployments need a shared
//! backend such as [`RedisBackend`](crate::store::redis::RedisBackend).
//!
//! # Clock
//!
//! Expiry is measured with [`tokio::time::Instant`], so tests running on a
//! paused tokio clock can lapse TTLs deterministically with
//! `tokio::time::advance`.
//!
//! # Concurrency
//!
//! Guarded writes hold the key's shard lock for the version check and the
//! write, which makes them atomic per key.
//!
//! # Examples
//!
//! ```
//! use xfer_tasks::store::memory::InMemoryStateStore;
//!
//! let store = InMemoryStateStore::in_memory();
//! assert!(store.backend().is_empty());
//! ```

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};
use crate::store::generic::GenericStateStore;

/// A [`GenericStateStore`] over an [`InMemoryBackend`].
pub type InMemoryStateStore = GenericStateStore<InMemoryBackend>;

impl GenericStateStore<InMemoryBackend> {
    /// Creates a state store backed by a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(InMemoryBackend::new())
    }
}

#[derive(Debug)]
struct StoredValue {
    data: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: &[u8], version: u64, now: Instant, ttl: Duration) -> Self {
        Self {
            data: data.to_vec(),
            version,
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }

    /// Version as seen by readers: `0` once expired.
    fn live_version(&self, now: Instant) -> u64 {
        if self.is_live(now) {
            self.version
        } else {
            0
        }
    }
}

/// Classifies a guarded operation given the expected and observed versions.
fn check_version(key: &str, expected: u64, actual: u64) -> Result<(), StorageError> {
    if expected == actual {
        Ok(())
    } else if actual == 0 {
        Err(StorageError::NotFound {
            key: key.to_string(),
        })
    } else {
        Err(StorageError::VersionConflict {
            key: key.to_string(),
            expected,
            actual,
        })
    }
}

/// Thread-safe in-memory storage backend using [`DashMap`].
///
/// # Examples
///
/// ```
/// use xfer_tasks::store::memory::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// assert!(backend.is_empty());
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    data: DashMap<String, StoredValue>,
}

impl InMemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Returns the number of stored keys, including expired ones not yet
    /// swept.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the backend holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let now = Instant::now();
        match self.data.get(key) {
            Some(entry) if entry.is_live(now) => Ok(VersionedRecord {
                data: entry.data.clone(),
                version: entry.version,
            }),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, data: &[u8], ttl: Duration) -> Result<u64, StorageError> {
        let now = Instant::now();
        let version = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let version = occupied.get().live_version(now) + 1;
                occupied.insert(StoredValue::new(data, version, now, ttl));
                version
            },
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(data, 1, now, ttl));
                1
            },
        };
        Ok(version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        ttl: Duration,
    ) -> Result<u64, StorageError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().live_version(now);
                check_version(key, expected_version, actual)?;
                let version = actual + 1;
                occupied.insert(StoredValue::new(data, version, now, ttl));
                Ok(version)
            },
            Entry::Vacant(vacant) => {
                check_version(key, expected_version, 0)?;
                vacant.insert(StoredValue::new(data, 1, now, ttl));
                Ok(1)
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, value)| value.is_live(now)))
    }

    async fn delete_if_version(
        &self,
        key: &str,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                check_version(key, expected_version, occupied.get().live_version(now))?;
                occupied.remove();
                Ok(())
            },
            Entry::Vacant(_) => check_version(key, expected_version, 0).and(Err(
                StorageError::NotFound {
                    key: key.to_string(),
                },
            )),
        }
    }

    async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        let now = Instant::now();
        let mut removed = 0;
        self.data.retain(|_, value| {
            let keep = value.is_live(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod backend_tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn get_missing_key_returns_not_found() {
        let backend = InMemoryBackend::new();
        let result = backend.get("task:missing").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn put_new_key_returns_version_1() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.put("k", b"data", TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_existing_key_increments_version() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"first", TTL).await.unwrap();
        assert_eq!(backend.put("k", b"second", TTL).await.unwrap(), 2);

        let record = backend.get("k").await.unwrap();
        assert_eq!(record.data, b"second");
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn put_if_version_zero_inserts_only_when_absent() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.put_if_version("k", b"a", 0, TTL).await.unwrap(), 1);

        let result = backend.put_if_version("k", b"b", 0, TTL).await;
        match result {
            Err(StorageError::VersionConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            },
            other => panic!("expected VersionConflict, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_if_version_succeeds_on_match() {
        let backend = InMemoryBackend::new();
        let v1 = backend.put("k", b"v1", TTL).await.unwrap();
        let v2 = backend.put_if_version("k", b"v2", v1, TTL).await.unwrap();
        assert_eq!(v2, v1 + 1);
        assert_eq!(backend.get("k").await.unwrap().data, b"v2");
    }

    #[tokio::test]
    async fn put_if_version_fails_on_mismatch() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"data", TTL).await.unwrap();
        let result = backend.put_if_version("k", b"new", 999, TTL).await;
        assert!(matches!(
            result,
            Err(StorageError::VersionConflict { expected: 999, .. })
        ));
        assert_eq!(backend.get("k").await.unwrap().data, b"data");
    }

    #[tokio::test]
    async fn put_if_version_on_missing_key_returns_not_found() {
        let backend = InMemoryBackend::new();
        let result = backend.put_if_version("k", b"data", 1, TTL).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"data", TTL).await.unwrap();
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_version_checks_version() {
        let backend = InMemoryBackend::new();
        let v = backend.put("k", b"data", TTL).await.unwrap();
        assert!(matches!(
            backend.delete_if_version("k", v + 1).await,
            Err(StorageError::VersionConflict { .. })
        ));
        backend.delete_if_version("k", v).await.unwrap();
        assert!(matches!(
            backend.delete_if_version("k", v).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_lapse_hides_key() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"data", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backend.get("k").await.is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            backend.get("k").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_lapse_restarts_versioning() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"old", Duration::from_secs(1)).await.unwrap();
        backend.put("k", b"old2", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        // An expired key counts as absent for guarded inserts.
        assert_eq!(backend.put_if_version("k", b"new", 0, TTL).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn put_refreshes_ttl() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"a", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        backend.put("k", b"b", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(backend.get("k").await.unwrap().data, b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_expired_removes_only_lapsed_keys() {
        let backend = InMemoryBackend::new();
        backend.put("short", b"a", Duration::from_secs(1)).await.unwrap();
        backend.put("long", b"b", Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(backend.cleanup_expired().await.unwrap(), 1);
        assert_eq!(backend.len(), 1);
        assert!(backend.get("long").await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_expired_returns_zero_on_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.cleanup_expired().await.unwrap(), 0);
    }
}
