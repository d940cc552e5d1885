//! Circuit breaker state machine.
//!
//! | From     | Event                          | To       |
//! |----------|--------------------------------|----------|
//! | Closed   | failures reach threshold       | Open     |
//! | Closed   | success                        | Closed (failures reset) |
//! | Open     | open duration elapsed          | HalfOpen |
//! | HalfOpen | successes reach threshold      | Closed   |
//! | HalfOpen | any failure                    | Open     |
//!
//! Every transition resets both counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Operating normally
    #[default]
    Closed,
    /// Failing fast
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A downstream dependency guarded by a circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// The API itself, used by the admission pipeline
    Api,
    Database,
    Cache,
    Broker,
    /// Any other named upstream
    Upstream(String),
}

impl Dependency {
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Dependency::Api => Cow::Borrowed("api"),
            Dependency::Database => Cow::Borrowed("database"),
            Dependency::Cache => Cow::Borrowed("cache"),
            Dependency::Broker => Cow::Borrowed("broker"),
            Dependency::Upstream(name) => Cow::Owned(format!("upstream:{name}")),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Thresholds for circuit transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures while Closed before opening
    pub failure_threshold: u32,
    /// Consecutive successes while HalfOpen before closing
    pub success_threshold: u32,
    /// How long to stay Open before probing
    #[serde(with = "crate::config::duration_secs")]
    pub open_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(60),
        }
    }
}

/// A state change produced by applying an event to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Persisted per-dependency circuit state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Only meaningful while Open
    pub opened_at_ms: Option<i64>,
}

impl CircuitRecord {
    fn transition_to(&mut self, to: CircuitState, now: DateTime<Utc>) -> Transition {
        let from = self.state;
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at_ms = match to {
            CircuitState::Open => Some(now.timestamp_millis()),
            _ => None,
        };
        Transition { from, to }
    }

    /// Move Open to HalfOpen once the open duration has elapsed.
    pub fn poll(&mut self, config: &CircuitConfig, now: DateTime<Utc>) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.opened_at_ms.unwrap_or(0);
        let elapsed_ms = (now.timestamp_millis() - opened_at).max(0) as u128;
        if elapsed_ms >= config.open_duration.as_millis() {
            Some(self.transition_to(CircuitState::HalfOpen, now))
        } else {
            None
        }
    }

    /// Apply a successful call.
    pub fn on_success(&mut self, config: &CircuitConfig, now: DateTime<Utc>) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.success_count = (self.success_count + 1).min(config.success_threshold);
                if self.success_count >= config.success_threshold {
                    Some(self.transition_to(CircuitState::Closed, now))
                } else {
                    None
                }
            }
            // A late result from a call started before the circuit opened
            CircuitState::Open => None,
        }
    }

    /// Apply a failed call.
    pub fn on_failure(&mut self, config: &CircuitConfig, now: DateTime<Utc>) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = (self.failure_count + 1).min(config.failure_threshold);
                if self.failure_count >= config.failure_threshold {
                    Some(self.transition_to(CircuitState::Open, now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => Some(self.transition_to(CircuitState::Open, now)),
            CircuitState::Open => None,
        }
    }
}
