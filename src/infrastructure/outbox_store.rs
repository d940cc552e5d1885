//! In-memory outbox store.
//!
//! Rows live in a `DashMap` keyed by id. A claim flips each row under its
//! shard lock after re-checking that it is still claimable, which gives the
//! same exclusivity as a conditional `UPDATE ... WHERE status = ...`.
//! Contents are lost on restart; use the SQLite store for durability.

use crate::application::ports::{Clock, OutboxStore, StoreError};
use crate::domain::outbox::{NewOutboxMessage, OutboxMessage, OutboxStatus};
use crate::infrastructure::clock::SystemClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug)]
pub struct InMemoryOutboxStore {
    messages: DashMap<u64, OutboxMessage, ahash::RandomState>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Stamp `created_at` from `clock` (mainly for testing).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: DashMap::with_hasher(ahash::RandomState::new()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn sorted_ids(&self, keep: impl Fn(&OutboxMessage) -> bool) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .messages
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn update_claimed(&self, id: u64, token: Uuid, f: impl FnOnce(&mut OutboxMessage)) -> bool {
        match self.messages.get_mut(&id) {
            Some(mut message) if message.is_claimed_by(token) => {
                f(&mut message);
                true
            }
            _ => false,
        }
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, message: NewOutboxMessage) -> Result<u64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.messages.insert(id, message.into_message(id, self.clock.now()));
        Ok(id)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        token: Uuid,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let visibility = chrono::Duration::from_std(visibility)
            .map_err(|e| StoreError::Backend(format!("visibility timeout: {e}")))?;
        let expires_at = now + visibility;
        let candidates =
            self.sorted_ids(|m| m.status != OutboxStatus::Completed && !m.is_terminal());

        let mut claimed = Vec::new();
        for id in candidates {
            if claimed.len() >= limit {
                break;
            }
            let Some(mut message) = self.messages.get_mut(&id) else {
                continue;
            };
            if message.expire_abandoned_claim(now) {
                tracing::warn!(id, "Outbox claim expired after final attempt");
                continue;
            }
            // Another claimer may have won since the scan
            if message.is_claimable(now) {
                message.mark_processing(token, expires_at, now);
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        id: u64,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.update_claimed(id, token, |m| m.mark_completed(now)))
    }

    async fn mark_failed(
        &self,
        id: u64,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.update_claimed(id, token, |m| m.mark_failed(error, now)))
    }

    async fn release(&self, id: u64, token: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.update_claimed(id, token, |m| m.release(now)))
    }

    async fn get(&self, id: u64) -> Result<Option<OutboxMessage>, StoreError> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn list(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        Ok(self
            .sorted_ids(|m| m.status == status)
            .into_iter()
            .filter_map(|id| self.messages.get(&id).map(|m| m.clone()))
            .take(limit)
            .collect())
    }

    async fn count_by_status(&self) -> Result<BTreeMap<OutboxStatus, u64>, StoreError> {
        let mut counts: BTreeMap<OutboxStatus, u64> =
            OutboxStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in self.messages.iter() {
            *counts.entry(entry.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
