//! Token bucket math for priority-aware rate limiting.
//!
//! Buckets refill continuously at a fixed rate up to their capacity. A request
//! consumes `cost` tokens and is rejected if insufficient tokens remain. The
//! functions here are pure; atomicity is the storage layer's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a bucket specification is invalid.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecError {
    /// Capacity must be positive and finite
    #[error("bucket capacity must be positive and finite, got {0}")]
    InvalidCapacity(f64),
    /// Refill rate must be positive and finite
    #[error("bucket refill rate must be positive and finite, got {0}")]
    InvalidRefillRate(f64),
}

/// Priority class of a caller.
///
/// The most privileged class gets the largest bucket and the fastest refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Low,
    Normal,
    High,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 3] =
        [PriorityClass::High, PriorityClass::Normal, PriorityClass::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::High => "high",
            PriorityClass::Normal => "normal",
            PriorityClass::Low => "low",
        }
    }

    /// Default `(capacity, refill_rate)` for this class.
    pub fn default_spec(&self) -> BucketSpec {
        match self {
            PriorityClass::High => BucketSpec { capacity: 200.0, refill_rate: 20.0 },
            PriorityClass::Normal => BucketSpec { capacity: 100.0, refill_rate: 10.0 },
            PriorityClass::Low => BucketSpec { capacity: 50.0, refill_rate: 5.0 },
        }
    }
}

impl Default for PriorityClass {
    fn default() -> Self {
        PriorityClass::Normal
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(PriorityClass::High),
            "normal" => Ok(PriorityClass::Normal),
            "low" => Ok(PriorityClass::Low),
            other => Err(format!("unknown priority class: {other}")),
        }
    }
}

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Maximum tokens the bucket can hold (burst size)
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl BucketSpec {
    /// Create a validated bucket spec.
    ///
    /// # Errors
    /// Returns `SpecError` if either value is non-positive or not finite.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self, SpecError> {
        let spec = Self { capacity, refill_rate };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err(SpecError::InvalidCapacity(self.capacity));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(SpecError::InvalidRefillRate(self.refill_rate));
        }
        Ok(())
    }
}

/// Outcome of a take attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketDecision {
    /// Tokens were deducted
    Allowed {
        /// Tokens left after the deduction
        remaining: f64,
    },
    /// Not enough tokens; nothing was deducted
    Rejected {
        /// Whole seconds until enough tokens will have accrued
        retry_after_secs: u64,
    },
}

impl BucketDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BucketDecision::Allowed { .. })
    }
}

/// Persisted state of one bucket.
///
/// `tokens == None` means the bucket has never been touched and is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: Option<f64>,
    pub last_refill_ms: i64,
}

impl TokenBucket {
    /// Tokens available at `now`, without mutating the bucket.
    pub fn available(&self, spec: &BucketSpec, now: DateTime<Utc>) -> f64 {
        match self.tokens {
            None => spec.capacity,
            Some(tokens) => {
                let elapsed_ms = (now.timestamp_millis() - self.last_refill_ms).max(0);
                let elapsed = elapsed_ms as f64 / 1000.0;
                (tokens + elapsed * spec.refill_rate).clamp(0.0, spec.capacity)
            }
        }
    }

    /// Refill to `now`, then deduct `cost` if enough tokens are available.
    ///
    /// On rejection the bucket is left untouched.
    pub fn try_take(&mut self, spec: &BucketSpec, cost: f64, now: DateTime<Utc>) -> BucketDecision {
        let tokens = self.available(spec, now);

        if tokens >= cost {
            let remaining = tokens - cost;
            self.tokens = Some(remaining);
            self.last_refill_ms = now.timestamp_millis();
            BucketDecision::Allowed { remaining }
        } else {
            let wait = ((cost - tokens) / spec.refill_rate).ceil();
            BucketDecision::Rejected {
                retry_after_secs: (wait as u64).max(1),
            }
        }
    }
}
