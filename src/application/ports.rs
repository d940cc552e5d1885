//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::alert::AlertRecord;
use crate::domain::load::LoadSnapshot;
use crate::domain::outbox::{NewOutboxMessage, OutboxMessage, OutboxStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use uuid::Uuid;

/// Port for obtaining current time.
///
/// State in the shared store is read by many processes, so time is wall-clock
/// UTC rather than a process-local `Instant`.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Error returned by the shared key/value store and the outbox store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("gave up updating {key} after {attempts} conflicting attempts")]
    Contention { key: String, attempts: u32 },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Outcome of an atomic read-modify-write closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation<R> {
    /// Persist the modified value and refresh its TTL
    Write(R),
    /// Leave the stored value (and its TTL) untouched
    Keep(R),
}

impl<R> Mutation<R> {
    pub fn into_inner(self) -> R {
        match self {
            Mutation::Write(r) | Mutation::Keep(r) => r,
        }
    }
}

/// Raw decision returned to [`KeyValueStore::update_raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMutation {
    Write(String),
    Keep,
}

/// Port for the shared key/value store.
///
/// Every operation is atomic per key. Values are opaque strings; typed access
/// goes through [`KeyValueStoreExt`]. Infrastructure provides concrete
/// implementations (ShardedStorage, RedisStorage).
pub trait KeyValueStore: Send + Sync + Debug {
    /// Atomically read-modify-write `key`.
    ///
    /// `f` sees the current value (None if absent or expired). It may run more
    /// than once when the backend retries on conflict.
    fn update_raw(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: &mut dyn FnMut(Option<&str>) -> RawMutation,
    ) -> Result<(), StoreError>;

    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns true if the key existed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add `by` to an integer counter, returning the new value.
    fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, StoreError>;

    /// Current counter value; zero if absent.
    fn counter(&self, key: &str) -> Result<i64, StoreError>;

    /// Add `member` to the sorted set at `key` with `score`.
    fn append(
        &self,
        key: &str,
        score: f64,
        member: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Members with `min <= score <= max`, ascending by score.
    fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError>;

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Returns the number of keys removed.
    fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Cheap liveness check of the backend.
    fn ping(&self) -> Result<(), StoreError>;
}

/// Typed access on top of [`KeyValueStore`], using JSON for values.
pub trait KeyValueStoreExt: KeyValueStore {
    /// Atomic read-modify-write of a typed value.
    ///
    /// Absent values start from `T::default()`. Undecodable values are logged
    /// and replaced by the default.
    fn update<T, R, F>(&self, key: &str, ttl: Duration, mut f: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(&mut T) -> Mutation<R>,
    {
        let mut result = None;
        let mut encode_error = None;

        self.update_raw(key, Some(ttl), &mut |current| {
            let mut value = decode_or_default::<T>(key, current);
            match f(&mut value) {
                Mutation::Write(r) => {
                    result = Some(r);
                    match serde_json::to_string(&value) {
                        Ok(raw) => RawMutation::Write(raw),
                        Err(e) => {
                            encode_error = Some(e);
                            RawMutation::Keep
                        }
                    }
                }
                Mutation::Keep(r) => {
                    result = Some(r);
                    RawMutation::Keep
                }
            }
        })?;

        if let Some(e) = encode_error {
            return Err(e.into());
        }
        result.ok_or_else(|| StoreError::Backend(format!("update of {key} did not run")))
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn store<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.set_raw(key, serde_json::to_string(value)?, ttl)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

fn decode_or_default<T: DeserializeOwned + Default>(key: &str, raw: Option<&str>) -> T {
    match raw {
        None => T::default(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, key = %key, "Discarding undecodable stored value");
            T::default()
        }),
    }
}

/// Error returned when host load cannot be sampled.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to read load source: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse load source: {0}")]
    Parse(String),
    #[error("load sampling is not supported on this platform")]
    Unsupported,
}

/// Port for sampling host CPU and memory utilisation.
pub trait LoadProbe: Send + Sync + Debug {
    fn sample(&self, now: DateTime<Utc>) -> Result<LoadSnapshot, ProbeError>;
}

/// Error returned when the broker does not confirm a publish.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker rejected message: {0}")]
    Rejected(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Properties attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// Outbox message id, for consumer-side deduplication
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: String,
    pub content_type: &'static str,
    pub persistent: bool,
}

/// Port for the message broker.
#[async_trait]
pub trait MessageBroker: Send + Sync + Debug {
    /// Idempotently declare a durable queue.
    async fn declare_queue(&self, name: &str) -> Result<(), PublishError>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError>;

    /// Cheap liveness check of the broker connection.
    async fn ping(&self) -> Result<(), PublishError>;
}

/// Port for durable outbox storage.
///
/// Status changes after a claim are conditional on the claim token, so a
/// worker whose claim expired cannot overwrite a newer claimant's result.
#[async_trait]
pub trait OutboxStore: Send + Sync + Debug {
    async fn insert(&self, message: NewOutboxMessage) -> Result<u64, StoreError>;

    /// Claim up to `limit` claimable messages, oldest first.
    ///
    /// Each returned message is already `Processing` with its attempt counted
    /// and `token` stamped, valid until `now + visibility`.
    async fn claim_batch(
        &self,
        limit: usize,
        token: Uuid,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Returns false if `token` no longer owns the message.
    async fn mark_completed(
        &self,
        id: u64,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Returns false if `token` no longer owns the message.
    async fn mark_failed(
        &self,
        id: u64,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Hand a claimed message back without counting the attempt.
    ///
    /// Returns false if `token` no longer owns the message.
    async fn release(&self, id: u64, token: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get(&self, id: u64) -> Result<Option<OutboxMessage>, StoreError>;

    /// Messages in `status`, oldest first.
    async fn list(&self, status: OutboxStatus, limit: usize)
        -> Result<Vec<OutboxMessage>, StoreError>;

    async fn count_by_status(&self) -> Result<BTreeMap<OutboxStatus, u64>, StoreError>;

    /// Cheap liveness check of the backing database.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Error returned by an alert channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("alert delivery failed: {0}")]
pub struct SinkError(pub String);

/// Port for one alert delivery channel (email, chat, ...).
///
/// Called on the request path; implementations that do network I/O should
/// hand off to a background task.
pub trait AlertSink: Send + Sync + Debug {
    fn send(&self, alert: &AlertRecord) -> Result<(), SinkError>;
}
