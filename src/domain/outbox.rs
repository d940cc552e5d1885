//! Transactional outbox messages.
//!
//! A message is written in the same transaction as the business change it
//! describes and relayed to the broker afterwards. Status moves
//! `Pending -> Processing -> {Completed | Failed}`, and `Failed` re-enters
//! `Processing` while attempts remain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default number of publish attempts before a message is terminally failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delivery status of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 4] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Completed,
        OutboxStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "completed" => Ok(OutboxStatus::Completed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// A message to be appended alongside a domain write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub max_attempts: u32,
}

impl NewOutboxMessage {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(aggregate_type, aggregate_id, event_type, payload))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Materialize the stored row.
    pub fn into_message(self, id: u64, now: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage {
            id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            payload: self.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            error_message: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            claim_token: None,
            claim_expires_at: None,
        }
    }
}

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: u64,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub claim_token: Option<Uuid>,
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Completed, or failed with no attempts left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            OutboxStatus::Completed => true,
            OutboxStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// Whether a processor may claim this row at `now`.
    ///
    /// A `Processing` row whose claim expired belongs to a crashed worker.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => self.can_retry(),
            OutboxStatus::Processing => {
                self.can_retry() && self.claim_expires_at.map_or(true, |expires| expires <= now)
            }
            OutboxStatus::Completed => false,
        }
    }

    pub fn mark_processing(&mut self, token: Uuid, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.attempts += 1;
        self.claim_token = Some(token);
        self.claim_expires_at = Some(expires_at);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Completed;
        self.processed_at = Some(now);
        self.updated_at = now;
        self.claim_token = None;
        self.claim_expires_at = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = OutboxStatus::Failed;
        self.error_message = Some(error.into());
        self.updated_at = now;
        self.claim_token = None;
        self.claim_expires_at = None;
    }

    /// Fail a row whose worker vanished after its final attempt.
    ///
    /// Returns true if the row changed.
    pub fn expire_abandoned_claim(&mut self, now: DateTime<Utc>) -> bool {
        let abandoned = self.status == OutboxStatus::Processing
            && !self.can_retry()
            && self.claim_expires_at.map_or(true, |expires| expires <= now);
        if abandoned {
            self.mark_failed("claim expired after final attempt", now);
        }
        abandoned
    }

    /// Hand a claimed row back unattempted.
    ///
    /// The attempt counted by the claim is returned and the row goes back to
    /// `Pending`, or to `Failed` if an earlier attempt had already failed.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_sub(1);
        self.status = if self.error_message.is_some() {
            OutboxStatus::Failed
        } else {
            OutboxStatus::Pending
        };
        self.updated_at = now;
        self.claim_token = None;
        self.claim_expires_at = None;
    }

    /// Whether `token` still owns this row.
    pub fn is_claimed_by(&self, token: Uuid) -> bool {
        self.status == OutboxStatus::Processing && self.claim_token == Some(token)
    }
}

/// Broker queue for an event type: `events.` + snake_case.
///
/// `OrderCreated` becomes `events.order_created`.
pub fn queue_name(event_type: &str) -> String {
    let mut name = String::with_capacity(event_type.len() + 12);
    name.push_str("events.");
    for (i, ch) in event_type.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                name.push('_');
            }
            name.push(ch.to_ascii_lowercase());
        } else {
            name.push(ch);
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboxMessage {
        NewOutboxMessage::new("order", "42", "OrderCreated", b"{}".to_vec())
            .into_message(1, Utc::now())
    }

    impl OutboxMessage {
        fn into_single_attempt(mut self) -> Self {
            self.max_attempts = 1;
            self
        }
    }

    #[test]
    fn test_queue_name() {
        assert_eq!(queue_name("OrderCreated"), "events.order_created");
        assert_eq!(queue_name("order_paid"), "events.order_paid");
        assert_eq!(queue_name("UserEmailChanged"), "events.user_email_changed");
        assert_eq!(queue_name("X"), "events.x");
    }

    #[test]
    fn test_queue_name_splits_on_ascii_capitals_only() {
        assert_eq!(queue_name("ÉtatChanged"), "events.État_changed");
        assert_eq!(queue_name("PedidoÑandúCreado"), "events.pedidoÑandú_creado");
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = message();
        assert_eq!(msg.status, OutboxStatus::Pending);
        assert_eq!(msg.attempts, 0);
        assert_eq!(msg.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(msg.is_claimable(Utc::now()));
    }

    #[test]
    fn test_failed_is_terminal_at_max_attempts() {
        let now = Utc::now();
        let mut msg = message();
        for _ in 0..3 {
            msg.mark_processing(Uuid::new_v4(), now, now);
            msg.mark_failed("broker down", now);
        }
        assert_eq!(msg.attempts, 3);
        assert!(msg.is_terminal());
        assert!(!msg.is_claimable(now));
    }

    #[test]
    fn test_expired_processing_claim_is_reclaimable() {
        let now = Utc::now();
        let mut msg = message();
        let expires = now + chrono::Duration::seconds(30);
        msg.mark_processing(Uuid::new_v4(), expires, now);

        assert!(!msg.is_claimable(now));
        assert!(msg.is_claimable(expires));
    }

    #[test]
    fn test_abandoned_final_attempt_becomes_failed() {
        let now = Utc::now();
        let mut msg = message().into_single_attempt();
        msg.mark_processing(Uuid::new_v4(), now, now);

        assert!(msg.expire_abandoned_claim(now));
        assert_eq!(msg.status, OutboxStatus::Failed);
        assert!(msg.is_terminal());
        assert!(!msg.expire_abandoned_claim(now));
    }

    #[test]
    fn test_completed_clears_claim() {
        let now = Utc::now();
        let mut msg = message();
        let token = Uuid::new_v4();
        msg.mark_processing(token, now, now);
        assert!(msg.is_claimed_by(token));

        msg.mark_completed(now);
        assert_eq!(msg.processed_at, Some(now));
        assert!(!msg.is_claimed_by(token));
        assert!(msg.is_terminal());
    }

    #[test]
    fn test_release_returns_the_attempt() {
        let now = Utc::now();
        let mut msg = message();
        msg.mark_processing(Uuid::new_v4(), now, now);
        msg.release(now);
        assert_eq!(msg.status, OutboxStatus::Pending);
        assert_eq!(msg.attempts, 0);
        assert_eq!(msg.claim_token, None);

        msg.mark_processing(Uuid::new_v4(), now, now);
        msg.mark_failed("broker down", now);
        msg.mark_processing(Uuid::new_v4(), now, now);
        msg.release(now);
        assert_eq!(msg.status, OutboxStatus::Failed);
        assert_eq!(msg.attempts, 1);
        assert!(msg.is_claimable(now));
    }

    #[test]
    fn test_json_payload() {
        let payload = serde_json::json!({"total": 10});
        let msg = NewOutboxMessage::json("order", "7", "OrderPaid", &payload)
            .unwrap()
            .with_max_attempts(0);
        assert_eq!(msg.max_attempts, 1);
        assert_eq!(msg.payload, br#"{"total":10}"#.to_vec());
    }
}
