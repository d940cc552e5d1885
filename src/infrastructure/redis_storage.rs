//! Redis-backed implementation of the shared key/value store.
//!
//! Lets every worker process share buckets, circuits, the throttle snapshot,
//! and metrics.
//!
//! ## Layout
//!
//! - Typed values live in a hash `{ v: version, d: data }`. `update_raw` is an
//!   optimistic compare-and-swap: read `v` and `d`, run the closure, then a Lua
//!   script writes only if `v` is unchanged. On conflict the closure re-runs.
//! - Counters are plain integer keys driven by `INCRBY`.
//! - Samples are sorted sets driven by `ZADD` / `ZRANGEBYSCORE`.
//!
//! All keys carry the configured prefix.
//!
//! ## Runtime
//!
//! The port is synchronous because admission checks run on the request path.
//! Inside a tokio runtime the calls go through `block_in_place`, which needs
//! the multi-threaded scheduler; outside one a temporary runtime is built.
//!
//! ## Example
//!
//! ```rust,ignore
//! use loadgate::infrastructure::redis_storage::RedisStorage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = RedisStorage::connect("redis://127.0.0.1/")
//!         .await
//!         .expect("Failed to connect to Redis");
//!     let store: Arc<dyn loadgate::KeyValueStore> = Arc::new(storage);
//! }
//! ```

use crate::application::ports::{KeyValueStore, RawMutation, StoreError};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'v')
if current == false then current = '0' end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'v', tostring(tonumber(current) + 1), 'd', ARGV[2])
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
else
  redis.call('PERSIST', KEYS[1])
end
return 1
"#;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStorageConfig {
    /// Key prefix for Redis keys (default: "loadgate:")
    pub key_prefix: String,
    /// Compare-and-swap attempts before giving up (default: 16)
    pub max_cas_attempts: u32,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: "loadgate:".to_string(),
            max_cas_attempts: 16,
        }
    }
}

/// Redis-backed shared store.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    config: RedisStorageConfig,
    cas: Arc<Script>,
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStorageConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStorageConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            cas: Arc::new(Script::new(CAS_SCRIPT)),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run an async Redis operation from the synchronous port.
    fn block_on<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tokio::task::block_in_place(|| handle.block_on(fut))
        } else {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| {
                    StoreError::Unavailable(format!("failed to create tokio runtime: {e}"))
                })?;
            rt.block_on(fut)
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let mut cursor = 0u64;
        let mut found = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            found.extend(keys);

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }
}

fn ttl_millis(ttl: Option<Duration>) -> i64 {
    ttl.map_or(0, |ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1))
}

impl KeyValueStore for RedisStorage {
    fn update_raw(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: &mut dyn FnMut(Option<&str>) -> RawMutation,
    ) -> Result<(), StoreError> {
        let full_key = self.key(key);
        let ttl_ms = ttl_millis(ttl);

        self.block_on(async {
            let mut conn = self.connection.clone();

            for _ in 0..self.config.max_cas_attempts {
                let (version, data): (Option<String>, Option<String>) = redis::cmd("HMGET")
                    .arg(&full_key)
                    .arg("v")
                    .arg("d")
                    .query_async(&mut conn)
                    .await?;

                let RawMutation::Write(value) = f(data.as_deref()) else {
                    return Ok(());
                };

                let swapped: i64 = self
                    .cas
                    .key(&full_key)
                    .arg(version.as_deref().unwrap_or("0"))
                    .arg(value)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await?;
                if swapped == 1 {
                    return Ok(());
                }
                tracing::trace!(key = %full_key, "Compare-and-swap conflict, retrying");
            }

            Err(StoreError::Contention {
                key: key.to_string(),
                attempts: self.config.max_cas_attempts,
            })
        })
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let full_key = self.key(key);
        self.block_on(async {
            let mut conn = self.connection.clone();
            let data: Option<String> = redis::cmd("HGET")
                .arg(&full_key)
                .arg("d")
                .query_async(&mut conn)
                .await?;
            Ok(data)
        })
    }

    fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let full_key = self.key(key);
        let ttl_ms = ttl_millis(ttl);
        self.block_on(async {
            let mut conn = self.connection.clone();
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("HINCRBY")
                .arg(&full_key)
                .arg("v")
                .arg(1)
                .ignore()
                .cmd("HSET")
                .arg(&full_key)
                .arg("d")
                .arg(value)
                .ignore();
            if ttl_ms > 0 {
                pipe.cmd("PEXPIRE").arg(&full_key).arg(ttl_ms).ignore();
            } else {
                pipe.cmd("PERSIST").arg(&full_key).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let full_key = self.key(key);
        self.block_on(async {
            let mut conn = self.connection.clone();
            let removed: i64 = redis::cmd("DEL").arg(&full_key).query_async(&mut conn).await?;
            Ok(removed > 0)
        })
    }

    fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let full_key = self.key(key);
        let ttl_ms = ttl_millis(ttl);
        self.block_on(async {
            let mut conn = self.connection.clone();
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("INCRBY").arg(&full_key).arg(by);
            if ttl_ms > 0 {
                pipe.cmd("PEXPIRE").arg(&full_key).arg(ttl_ms).ignore();
            }
            let (value,): (i64,) = pipe.query_async(&mut conn).await?;
            Ok(value)
        })
    }

    fn counter(&self, key: &str) -> Result<i64, StoreError> {
        let full_key = self.key(key);
        self.block_on(async {
            let mut conn = self.connection.clone();
            let value: Option<i64> = redis::cmd("GET").arg(&full_key).query_async(&mut conn).await?;
            Ok(value.unwrap_or(0))
        })
    }

    fn append(
        &self,
        key: &str,
        score: f64,
        member: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let full_key = self.key(key);
        let ttl_ms = ttl_millis(ttl);
        self.block_on(async {
            let mut conn = self.connection.clone();
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("ZADD").arg(&full_key).arg(score).arg(member).ignore();
            if ttl_ms > 0 {
                pipe.cmd("PEXPIRE").arg(&full_key).arg(ttl_ms).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError> {
        let full_key = self.key(key);
        self.block_on(async {
            let mut conn = self.connection.clone();
            let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&full_key)
                .arg(min)
                .arg(max)
                .query_async(&mut conn)
                .await?;
            Ok(members)
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", self.key(prefix));
        self.block_on(async {
            let keys = self.scan(&pattern).await?;
            Ok(keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&self.config.key_prefix).map(str::to_owned))
                .collect())
        })
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let pattern = format!("{}*", self.key(prefix));
        self.block_on(async {
            let keys = self.scan(&pattern).await?;
            let mut conn = self.connection.clone();
            let mut removed = 0usize;

            for chunk in keys.chunks(100) {
                let count: i64 = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
                removed += usize::try_from(count).unwrap_or(0);
            }
            Ok(removed)
        })
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.block_on(async {
            let mut conn = self.connection.clone();
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
    }
}
