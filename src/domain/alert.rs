//! Alert kinds, channels, and delivery rules.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    HighCpuUsage,
    HighMemoryUsage,
    /// The adaptive throttler rejected a request
    Overloaded,
    /// An outbox message exhausted its attempts
    OutboxMessageFailed,
    CircuitOpened,
    Custom(String),
}

impl AlertKind {
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            AlertKind::HighErrorRate => Cow::Borrowed("high_error_rate"),
            AlertKind::HighCpuUsage => Cow::Borrowed("high_cpu_usage"),
            AlertKind::HighMemoryUsage => Cow::Borrowed("high_memory_usage"),
            AlertKind::Overloaded => Cow::Borrowed("overloaded"),
            AlertKind::OutboxMessageFailed => Cow::Borrowed("outbox_message_failed"),
            AlertKind::CircuitOpened => Cow::Borrowed("circuit_opened"),
            AlertKind::Custom(name) => Cow::Owned(format!("custom:{name}")),
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Where an alert is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertChannel {
    /// Always available; writes through `tracing`
    Log,
    Email,
    Slack,
    Telegram,
}

impl fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertChannel::Log => "log",
            AlertChannel::Email => "email",
            AlertChannel::Slack => "slack",
            AlertChannel::Telegram => "telegram",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Delivery rule for one alert kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub severity: Severity,
    pub channels: Vec<AlertChannel>,
    /// Minimum spacing between two alerts of the same kind
    #[serde(with = "crate::config::duration_secs")]
    pub throttle: Duration,
}

impl AlertRule {
    pub fn new(severity: Severity, channels: impl Into<Vec<AlertChannel>>) -> Self {
        Self {
            severity,
            channels: channels.into(),
            throttle: DEFAULT_ALERT_THROTTLE,
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}

pub const DEFAULT_ALERT_THROTTLE: Duration = Duration::from_secs(300);

/// Rules for the built-in alert kinds.
pub fn default_rules() -> HashMap<AlertKind, AlertRule> {
    use AlertChannel::*;

    HashMap::from([
        (AlertKind::HighErrorRate, AlertRule::new(Severity::Critical, [Log, Email, Slack])),
        (AlertKind::HighCpuUsage, AlertRule::new(Severity::Warning, [Log, Slack])),
        (AlertKind::HighMemoryUsage, AlertRule::new(Severity::Warning, [Log, Slack])),
        (AlertKind::Overloaded, AlertRule::new(Severity::Warning, [Log])),
        (
            AlertKind::OutboxMessageFailed,
            AlertRule::new(Severity::Critical, [Log, Email]),
        ),
        (AlertKind::CircuitOpened, AlertRule::new(Severity::Critical, [Log, Slack])),
    ])
}

/// A delivered alert, kept for the status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub context: serde_json::Value,
    /// Unix seconds
    pub timestamp: f64,
}
