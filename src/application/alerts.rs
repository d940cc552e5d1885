//! Alert dispatch with per-kind throttling and history.
//!
//! Each [`AlertKind`] has a rule naming its severity, channels, and throttle
//! window. Delivery is fire-and-forget: failures are logged, never returned.

use crate::application::ports::{
    AlertSink, Clock, KeyValueStore, KeyValueStoreExt, Mutation, StoreError,
};
use crate::application::timeseries::{days_between, unix_secs};
use crate::domain::alert::{
    default_rules, AlertChannel, AlertKind, AlertRecord, AlertRule, Severity,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const THROTTLE_PREFIX: &str = "alert:throttle:";
const HISTORY_PREFIX: &str = "alert:history:";
/// Days of history partitions scanned by [`AlertManager::history`]
const HISTORY_SCAN_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub rules: HashMap<AlertKind, AlertRule>,
    pub history_retention_days: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            history_retention_days: 30,
        }
    }
}

/// What happened to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Sent,
    /// Same kind already sent within the rule's throttle window
    Throttled,
    /// No rule configured for the kind
    NoRule,
}

#[derive(Debug)]
pub struct AlertManager {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    rules: HashMap<AlertKind, AlertRule>,
    sinks: HashMap<AlertChannel, Arc<dyn AlertSink>>,
    history_ttl: Duration,
}

impl AlertManager {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, clock, &AlertConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: &AlertConfig,
    ) -> Self {
        let retention_days = u64::from(config.history_retention_days.max(1));
        Self {
            store,
            clock,
            rules: config.rules.clone(),
            sinks: HashMap::new(),
            history_ttl: Duration::from_secs(retention_days * 86_400),
        }
    }

    /// Deliver `channel` alerts through `sink`. The log channel is built in.
    pub fn with_sink(mut self, channel: AlertChannel, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.insert(channel, sink);
        self
    }

    pub fn with_rule(mut self, kind: AlertKind, rule: AlertRule) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    pub fn send_alert(
        &self,
        kind: AlertKind,
        message: impl Into<String>,
        context: serde_json::Value,
    ) -> AlertOutcome {
        let Some(rule) = self.rules.get(&kind) else {
            tracing::warn!(kind = %kind, "No alert rule found");
            return AlertOutcome::NoRule;
        };

        if !self.should_send(&kind, rule) {
            tracing::debug!(kind = %kind, "Alert throttled");
            return AlertOutcome::Throttled;
        }

        let record = AlertRecord {
            kind,
            severity: rule.severity,
            message: message.into(),
            context,
            timestamp: unix_secs(self.clock.now()),
        };

        for channel in &rule.channels {
            self.dispatch(*channel, &record);
        }

        if let Err(e) = self.record_history(&record) {
            tracing::warn!(error = %e, kind = %record.kind, "Failed to record alert history");
        }
        AlertOutcome::Sent
    }

    /// Claim the throttle window for `kind`. Fails open on store errors.
    fn should_send(&self, kind: &AlertKind, rule: &AlertRule) -> bool {
        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = i64::try_from(rule.throttle.as_millis()).unwrap_or(i64::MAX);
        let key = format!("{THROTTLE_PREFIX}{kind}");

        let claimed = self
            .store
            .update(&key, rule.throttle, |last_sent: &mut Option<i64>| match *last_sent {
                Some(last) if now_ms.saturating_sub(last) < window_ms => Mutation::Keep(false),
                _ => {
                    *last_sent = Some(now_ms);
                    Mutation::Write(true)
                }
            });

        claimed.unwrap_or_else(|e| {
            tracing::warn!(error = %e, kind = %kind, "Alert throttle unavailable, sending anyway");
            true
        })
    }

    fn dispatch(&self, channel: AlertChannel, record: &AlertRecord) {
        if channel == AlertChannel::Log {
            log_alert(record);
            return;
        }

        match self.sinks.get(&channel) {
            Some(sink) => {
                if let Err(e) = sink.send(record) {
                    tracing::warn!(
                        error = %e,
                        channel = %channel,
                        kind = %record.kind,
                        "Alert delivery failed"
                    );
                }
            }
            None => tracing::debug!(channel = %channel, "No sink registered for alert channel"),
        }
    }

    fn record_history(&self, record: &AlertRecord) -> Result<(), StoreError> {
        let day = self.clock.now().date_naive();
        self.store.append(
            &format!("{HISTORY_PREFIX}{}", day.format("%Y-%m-%d")),
            record.timestamp,
            serde_json::to_string(record)?,
            Some(self.history_ttl),
        )
    }

    /// Alerts sent in the last `hours` hours, oldest first.
    ///
    /// Only the last seven days of history are searched.
    pub fn history(&self, hours: u32) -> Result<Vec<AlertRecord>, StoreError> {
        let now = self.clock.now();
        let from = now - chrono::Duration::hours(i64::from(hours));
        let earliest_day = now - chrono::Duration::days(HISTORY_SCAN_DAYS - 1);
        let scan_from = from.max(earliest_day);
        let (min, max) = (unix_secs(from), unix_secs(now));

        let mut alerts = Vec::new();
        for day in days_between(scan_from, now) {
            let key = format!("{HISTORY_PREFIX}{}", day.format("%Y-%m-%d"));
            for raw in self.store.range_by_score(&key, min, max)? {
                match serde_json::from_str::<AlertRecord>(&raw) {
                    Ok(record) => alerts.push(record),
                    Err(e) => tracing::warn!(error = %e, "Skipping undecodable alert record"),
                }
            }
        }
        alerts.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(alerts)
    }
}

fn log_alert(record: &AlertRecord) {
    let kind = record.kind.name();
    let context = &record.context;
    let message = &record.message;
    match record.severity {
        Severity::Critical => tracing::error!(kind = %kind, context = %context, "{message}"),
        Severity::Warning => tracing::warn!(kind = %kind, context = %context, "{message}"),
        Severity::Info => tracing::info!(kind = %kind, context = %context, "{message}"),
    }
}

/// Sink that drops everything. Useful for disabling a channel explicitly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AlertSink for NullSink {
    fn send(&self, _alert: &AlertRecord) -> Result<(), crate::application::ports::SinkError> {
        Ok(())
    }
}
