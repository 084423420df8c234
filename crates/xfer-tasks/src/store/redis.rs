//! Redis storage backend for shared task state.
//!
//! [`RedisBackend`] implements [`StorageBackend`] on Redis so that every
//! server process observes the same task records. Reads use `HGETALL`;
//! writes and guarded deletes are Lua scripts (`redis::Script`) that check
//! the version, write, and set the TTL in a single round-trip.
//!
//! # Key Schema
//!
//! Every logical key (`task:{id}`, `owner:{id}`) is stored as a hash under
//! `{prefix}:{key}`:
//!
//! | Field | Type | Description |
//! |-------|------|-------------|
//! | `version` | String (u64) | Monotonic CAS version, starts at 1 |
//! | `data` | String (JSON) | Serialized record |
//!
//! TTL is native (`PEXPIRE`), so an elapsed key simply disappears and
//! [`cleanup_expired`](StorageBackend::cleanup_expired) is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use xfer_tasks::store::generic::GenericStateStore;
//! use xfer_tasks::store::redis::RedisBackend;
//!
//! # async fn example() {
//! let backend = RedisBackend::new("redis://127.0.0.1:6379").await.unwrap();
//! let store = GenericStateStore::new(backend);
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

/// Default namespace for all keys written by this backend.
pub const DEFAULT_KEY_PREFIX: &str = "xfer";

/// Unconditional put: bump version, write data, set TTL.
///
/// KEYS[1] = hash key. ARGV[1] = data, ARGV[2] = TTL in milliseconds.
/// Returns: new version number.
const LUA_PUT: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
local new_version
if current_version then
    new_version = tonumber(current_version) + 1
else
    new_version = 1
end

redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]))

return new_version
"#;

/// Conditional put (CAS). An expected version of 0 means "must be absent".
///
/// KEYS[1] = hash key. ARGV[1] = data, ARGV[2] = expected version,
/// ARGV[3] = TTL in milliseconds.
/// Returns: {status, value} where status 1=success, 0=mismatch, -1=missing.
const LUA_PUT_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
local expected = tonumber(ARGV[2])
local actual = 0
if current_version then
    actual = tonumber(current_version)
end

if actual ~= expected then
    if actual == 0 then
        return {-1, 0}
    end
    return {0, actual}
end

local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[3]))

return {1, new_version}
"#;

/// Conditional delete.
///
/// KEYS[1] = hash key. ARGV[1] = expected version.
/// Returns: {status, value} where status 1=deleted, 0=mismatch, -1=missing.
const LUA_DELETE_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end

local actual = tonumber(current_version)
if actual ~= tonumber(ARGV[1]) then
    return {0, actual}
end

redis.call('DEL', KEYS[1])
return {1, actual}
"#;

/// Redis storage backend.
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone; every clone
/// shares the same TCP connection. Each method clones it so the backend can
/// be used from many tasks at once.
///
/// # Examples
///
/// ```rust,no_run
/// use xfer_tasks::store::redis::RedisBackend;
///
/// # async fn example() {
/// // Separate deployments sharing one Redis get distinct namespaces:
/// let backend = RedisBackend::new("redis://127.0.0.1:6379")
///     .await
///     .unwrap()
///     .with_prefix("staging");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisBackend {
    /// Connects to Redis at the given URL.
    ///
    /// The URL format is `redis://[:<password>@]<host>:<port>[/<db>]`.
    /// Fails fast if the connection cannot be established.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the client cannot be created or
    /// the connection fails.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    /// Creates a backend over a pre-built multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Sets a custom key prefix (builder pattern).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn hash_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PEXPIRE rejects 0; the shortest lifetime Redis accepts is 1ms.
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn data_str<'a>(key: &str, data: &'a [u8]) -> Result<&'a str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::Backend {
        message: format!("value for key {key} is not valid UTF-8: {e}"),
        source: Some(Box::new(e)),
    })
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

/// Interprets the `{status, value}` pair returned by the guarded scripts.
fn guarded_result(key: &str, expected: u64, result: (i64, i64)) -> Result<u64, StorageError> {
    match result.0 {
        1 => Ok(result.1.unsigned_abs()),
        0 => Err(StorageError::VersionConflict {
            key: key.to_string(),
            expected,
            actual: result.1.unsigned_abs(),
        }),
        _ => Err(StorageError::NotFound {
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.hash_key(key))
            .await
            .map_err(|e| map_redis_error(e, key))?;

        if fields.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }

        let version: u64 = fields
            .get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::Backend {
                message: format!("missing or invalid version field for key {key}"),
                source: None,
            })?;
        let data = fields.get("data").ok_or_else(|| StorageError::Backend {
            message: format!("missing data field for key {key}"),
            source: None,
        })?;

        Ok(VersionedRecord {
            data: data.as_bytes().to_vec(),
            version,
        })
    }

    async fn put(&self, key: &str, data: &[u8], ttl: Duration) -> Result<u64, StorageError> {
        let data = data_str(key, data)?;
        Script::new(LUA_PUT)
            .key(self.hash_key(key))
            .arg(data)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        ttl: Duration,
    ) -> Result<u64, StorageError> {
        let data = data_str(key, data)?;
        let result: (i64, i64) = Script::new(LUA_PUT_IF_VERSION)
            .key(self.hash_key(key))
            .arg(data)
            .arg(expected_version)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        guarded_result(key, expected_version, result)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let removed: i64 = self
            .conn
            .clone()
            .del(self.hash_key(key))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn delete_if_version(
        &self,
        key: &str,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let result: (i64, i64) = Script::new(LUA_DELETE_IF_VERSION)
            .key(self.hash_key(key))
            .arg(expected_version)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        guarded_result(key, expected_version, result).map(|_| ())
    }

    /// No-op: Redis expires keys on its own.
    async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}


/// Contract tests against a real Redis instance.
///
/// Requires a running Redis (default `redis://127.0.0.1:6379`, override
/// with `REDIS_URL`). Run with:
///
/// ```bash
/// cargo test -p xfer-tasks --features redis-tests -- redis_
/// ```
///
/// Each test uses a UUID prefix, so runs never interfere.
#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    async fn test_backend() -> RedisBackend {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisBackend::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
            .with_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn redis_get_missing_key_returns_not_found() {
        let backend = test_backend().await;
        let result = backend.get("task:nonexistent").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn redis_put_increments_version() {
        let backend = test_backend().await;
        assert_eq!(backend.put("task:t1", b"first", TTL).await.unwrap(), 1);
        assert_eq!(backend.put("task:t1", b"second", TTL).await.unwrap(), 2);

        let record = backend.get("task:t1").await.unwrap();
        assert_eq!(record.data, b"second");
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn redis_put_if_version_zero_requires_absence() {
        let backend = test_backend().await;
        assert_eq!(
            backend
                .put_if_version("owner:u1", b"a", 0, TTL)
                .await
                .unwrap(),
            1
        );
        assert!(matches!(
            backend.put_if_version("owner:u1", b"b", 0, TTL).await,
            Err(StorageError::VersionConflict { actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn redis_put_if_version_missing_key_returns_not_found() {
        let backend = test_backend().await;
        assert!(matches!(
            backend.put_if_version("task:none", b"data", 1, TTL).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn redis_delete_if_version() {
        let backend = test_backend().await;
        let v = backend.put("owner:u1", b"slot", TTL).await.unwrap();
        assert!(matches!(
            backend.delete_if_version("owner:u1", v + 1).await,
            Err(StorageError::VersionConflict { .. })
        ));
        backend.delete_if_version("owner:u1", v).await.unwrap();
        assert!(!backend.delete("owner:u1").await.unwrap());
    }

    #[tokio::test]
    async fn redis_ttl_lapse_removes_key() {
        let backend = test_backend().await;
        backend
            .put("task:short", b"data", Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            backend.get("task:short").await,
            Err(StorageError::NotFound { .. })
        ));
    }
}
