//! In-process implementation of the shared key/value store.
//!
//! Provides concurrent, sharded storage for single-process deployments and
//! tests. Each key is mutated under its DashMap shard lock, so `update_raw`
//! is atomic per key.

use crate::application::ports::{Clock, KeyValueStore, RawMutation, StoreError};
use crate::infrastructure::clock::SystemClock;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Counter(i64),
    /// Sorted by (score, member)
    Sorted(Vec<(f64, String)>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Text(_) => "string",
            Value::Counter(_) => "counter",
            Value::Sorted(_) => "sorted set",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe sharded storage backed by DashMap.
///
/// DashMap provides lock-free reads and fine-grained locking for writes,
/// making it suitable for per-request admission checks. Expired keys are
/// dropped lazily on access and in bulk by [`ShardedStorage::purge_expired`].
#[derive(Debug)]
pub struct ShardedStorage {
    map: DashMap<String, StoredEntry, ahash::RandomState>,
    clock: Arc<dyn Clock>,
}

impl ShardedStorage {
    /// Create a new sharded storage instance using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a storage instance whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            map: DashMap::with_hasher(ahash::RandomState::new()),
            clock,
        }
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.map.len())
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| {
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
        })
    }

    /// Drop `key` if it has expired, so the next entry lookup starts fresh.
    fn drop_expired(&self, key: &str, now: DateTime<Utc>) {
        self.map.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

impl Default for ShardedStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> StoreError {
    StoreError::Backend(format!(
        "key {key} holds a {} where a {expected} was expected",
        found.kind()
    ))
}

impl KeyValueStore for ShardedStorage {
    fn update_raw(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: &mut dyn FnMut(Option<&str>) -> RawMutation,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl);

        self.drop_expired(key, now);
        match self.map.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let decision = match &occupied.get().value {
                    Value::Text(current) => f(Some(current.as_str())),
                    other => return Err(wrong_type(key, "string", other)),
                };
                if let RawMutation::Write(value) = decision {
                    occupied.insert(StoredEntry {
                        value: Value::Text(value),
                        expires_at,
                    });
                }
            }
            Entry::Vacant(vacant) => {
                if let RawMutation::Write(value) = f(None) {
                    vacant.insert(StoredEntry {
                        value: Value::Text(value),
                        expires_at,
                    });
                }
            }
        }
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let Some(entry) = self.map.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            return Ok(None);
        }
        match &entry.value {
            Value::Text(text) => Ok(Some(text.clone())),
            Value::Counter(n) => Ok(Some(n.to_string())),
            other => Err(wrong_type(key, "string", other)),
        }
    }

    fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.map.insert(
            key.to_owned(),
            StoredEntry {
                value: Value::Text(value),
                expires_at: self.expiry(now, ttl),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl);

        self.drop_expired(key, now);
        let mut entry = self.map.entry(key.to_owned()).or_insert_with(|| StoredEntry {
            value: Value::Counter(0),
            expires_at,
        });
        let next = match &entry.value {
            Value::Counter(n) => n.saturating_add(by),
            Value::Text(text) => match text.parse::<i64>() {
                Ok(n) => n.saturating_add(by),
                Err(_) => return Err(wrong_type(key, "counter", &entry.value)),
            },
            other => return Err(wrong_type(key, "counter", other)),
        };
        entry.value = Value::Counter(next);
        if expires_at.is_some() {
            entry.expires_at = expires_at;
        }
        Ok(next)
    }

    fn counter(&self, key: &str) -> Result<i64, StoreError> {
        match self.get_raw(key)? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Backend(format!("key {key} does not hold an integer"))),
            None => Ok(0),
        }
    }

    fn append(
        &self,
        key: &str,
        score: f64,
        member: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl);

        self.drop_expired(key, now);
        let mut entry = self.map.entry(key.to_owned()).or_insert_with(|| StoredEntry {
            value: Value::Sorted(Vec::new()),
            expires_at,
        });
        if !matches!(entry.value, Value::Sorted(_)) {
            return Err(wrong_type(key, "sorted set", &entry.value));
        }
        if let Value::Sorted(members) = &mut entry.value {
            // Re-adding a member moves it, as ZADD does
            members.retain(|(_, existing)| *existing != member);
            let at = members
                .partition_point(|(s, m)| s.total_cmp(&score).then_with(|| m.cmp(&member)).is_lt());
            members.insert(at, (score, member));
        }

        if expires_at.is_some() {
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let Some(entry) = self.map.get(key) else {
            return Ok(Vec::new());
        };
        if entry.is_expired(now) {
            return Ok(Vec::new());
        }
        match &entry.value {
            Value::Sorted(members) => Ok(members
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .map(|(_, member)| member.clone())
                .collect()),
            other => Err(wrong_type(key, "sorted set", other)),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .map
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let before = self.map.len();
        self.map.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.map.len()))
    }

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
