//! Priority-aware token bucket rate limiting on the shared store.
//!
//! One bucket per subject at `rate_limit:<subject>`. The caller's priority
//! class picks the capacity and refill rate; the bucket itself is keyed by
//! identity alone, so switching class cannot mint a fresh bucket.

use crate::application::ports::{Clock, KeyValueStore, KeyValueStoreExt, Mutation, StoreError};
use crate::domain::bucket::{BucketDecision, BucketSpec, PriorityClass, SpecError, TokenBucket};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "rate_limit:";

/// Idle buckets are dropped after this long.
pub const BUCKET_TTL: Duration = Duration::from_secs(3600);

/// Bucket sizes per priority class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub high: BucketSpec,
    pub normal: BucketSpec,
    pub low: BucketSpec,
    #[serde(with = "crate::config::duration_secs")]
    pub ttl: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            high: PriorityClass::High.default_spec(),
            normal: PriorityClass::Normal.default_spec(),
            low: PriorityClass::Low.default_spec(),
            ttl: BUCKET_TTL,
        }
    }
}

impl RateLimiterConfig {
    pub fn spec(&self, class: PriorityClass) -> BucketSpec {
        match class {
            PriorityClass::High => self.high,
            PriorityClass::Normal => self.normal,
            PriorityClass::Low => self.low,
        }
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        PriorityClass::ALL.iter().try_for_each(|class| self.spec(*class).validate())
    }
}

/// Error returned by [`PriorityRateLimiter::check_limit`].
#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    /// The request can never be admitted by this class's bucket
    #[error("cost {cost} exceeds {class} bucket capacity {capacity}")]
    CostExceedsCapacity {
        cost: f64,
        capacity: f64,
        class: PriorityClass,
    },
    #[error("cost must be positive and finite, got {0}")]
    InvalidCost(f64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Who is calling, as established by authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    Anonymous { address: String },
    Authenticated { user_id: String, premium: bool },
}

impl CallerIdentity {
    pub fn anonymous(address: impl Into<String>) -> Self {
        CallerIdentity::Anonymous { address: address.into() }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        CallerIdentity::Authenticated {
            user_id: user_id.into(),
            premium: false,
        }
    }

    pub fn premium(user_id: impl Into<String>) -> Self {
        CallerIdentity::Authenticated {
            user_id: user_id.into(),
            premium: true,
        }
    }

    /// Rate limit subject: `user:<id>` or `ip:<address>`.
    pub fn subject(&self) -> String {
        match self {
            CallerIdentity::Anonymous { address } => format!("ip:{address}"),
            CallerIdentity::Authenticated { user_id, .. } => format!("user:{user_id}"),
        }
    }

    /// Priority class granted to this identity.
    pub fn priority(&self) -> PriorityClass {
        match self {
            CallerIdentity::Authenticated { premium: true, .. } => PriorityClass::High,
            CallerIdentity::Authenticated { premium: false, .. } => PriorityClass::Normal,
            CallerIdentity::Anonymous { .. } => PriorityClass::Low,
        }
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject())
    }
}

/// Priority for `identity`. A client hint can only lower it.
pub fn priority_for(identity: &CallerIdentity, hint: Option<PriorityClass>) -> PriorityClass {
    let granted = identity.priority();
    hint.map_or(granted, |hint| hint.min(granted))
}

#[derive(Debug, Clone)]
pub struct PriorityRateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: RateLimiterConfig,
}

impl PriorityRateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config: RateLimiterConfig::default(),
        }
    }

    /// # Errors
    /// Returns `SpecError` if any bucket spec is invalid.
    pub fn with_config(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: RateLimiterConfig,
    ) -> Result<Self, SpecError> {
        config.validate()?;
        Ok(Self { store, clock, config })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn key(subject: &str) -> String {
        format!("{KEY_PREFIX}{subject}")
    }

    /// Take `cost` tokens from `subject`'s bucket.
    ///
    /// Rejections leave the bucket untouched.
    pub fn check_limit(
        &self,
        subject: &str,
        priority: PriorityClass,
        cost: f64,
    ) -> Result<BucketDecision, LimitError> {
        if !cost.is_finite() || cost <= 0.0 {
            return Err(LimitError::InvalidCost(cost));
        }
        let spec = self.config.spec(priority);
        if cost > spec.capacity {
            return Err(LimitError::CostExceedsCapacity {
                cost,
                capacity: spec.capacity,
                class: priority,
            });
        }

        let now = self.clock.now();
        let decision = self
            .store
            .update(&Self::key(subject), self.config.ttl, |bucket: &mut TokenBucket| {
                match bucket.try_take(&spec, cost, now) {
                    allowed @ BucketDecision::Allowed { .. } => Mutation::Write(allowed),
                    rejected => Mutation::Keep(rejected),
                }
            })?;

        if let BucketDecision::Rejected { retry_after_secs } = decision {
            tracing::debug!(
                subject = %subject,
                priority = %priority,
                retry_after_secs,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Tokens `subject` could spend right now, without consuming any.
    pub fn tokens(&self, subject: &str, priority: PriorityClass) -> Result<f64, StoreError> {
        let bucket: TokenBucket = self.store.load(&Self::key(subject))?.unwrap_or_default();
        Ok(bucket.available(&self.config.spec(priority), self.clock.now()))
    }

    /// Refill `subject`'s bucket. Returns true if it existed.
    pub fn reset(&self, subject: &str) -> Result<bool, StoreError> {
        self.store.remove(&Self::key(subject))
    }
}
