//! Request and error metrics on top of the time series store.
//!
//! Every admission stage reports here; dashboards and the health monitor
//! read summaries back out.

use crate::application::ports::StoreError;
use crate::application::timeseries::{TimeSeriesStore, DEFAULT_RETENTION_DAYS};
use crate::domain::sample::{MetricSample, RequestSummary, SLOW_REQUEST_SECS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const REQUEST_METRIC: &str = "request";
pub const ERROR_METRIC: &str = "error";
pub const THROTTLE_METRIC: &str = "throttle";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Days to keep samples and counters
    pub retention_days: u32,
    /// Requests slower than this bump `request_slow`
    pub slow_request_secs: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            slow_request_secs: SLOW_REQUEST_SECS,
        }
    }
}

/// Records samples and counters and computes rolling summaries.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    series: TimeSeriesStore,
    slow_request_secs: f64,
}

impl MetricsCollector {
    pub fn new(series: TimeSeriesStore) -> Self {
        Self::with_config(series, &MetricsConfig::default())
    }

    pub fn with_config(series: TimeSeriesStore, config: &MetricsConfig) -> Self {
        Self {
            series: series.with_retention_days(config.retention_days),
            slow_request_secs: config.slow_request_secs,
        }
    }

    pub fn series(&self) -> &TimeSeriesStore {
        &self.series
    }

    pub fn record(&self, name: &str, data: serde_json::Value) -> Result<MetricSample, StoreError> {
        self.series.record(name, data)
    }

    pub fn increment(&self, counter: &str, by: i64) -> Result<i64, StoreError> {
        self.series.increment(counter, by)
    }

    pub fn counter(&self, name: &str) -> Result<i64, StoreError> {
        self.series.counter(name)
    }

    pub fn current(&self, name: &str) -> Result<Option<MetricSample>, StoreError> {
        self.series.current(name)
    }

    pub fn samples(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        self.series.range(name, from, to)
    }

    /// Record one handled request.
    pub fn record_request(
        &self,
        duration: Duration,
        status_code: u16,
        endpoint: &str,
    ) -> Result<(), StoreError> {
        let secs = duration.as_secs_f64();
        self.record(
            REQUEST_METRIC,
            json!({
                "duration": secs,
                "status_code": status_code,
                "endpoint": endpoint,
            }),
        )?;

        self.increment("request_total", 1)?;
        self.increment(&format!("request_status_{status_code}"), 1)?;
        if secs > self.slow_request_secs {
            self.increment("request_slow", 1)?;
        }
        Ok(())
    }

    /// Record one error. `kind` becomes part of a counter name.
    pub fn record_error(
        &self,
        kind: &str,
        message: &str,
        context: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.record(
            ERROR_METRIC,
            json!({
                "type": kind,
                "message": message,
                "context": context,
            }),
        )?;

        self.increment("error_total", 1)?;
        self.increment(&format!("error_type_{kind}"), 1)?;
        Ok(())
    }

    /// Summary of the last `window_minutes` minutes.
    pub fn get_summary(&self, window_minutes: u32) -> Result<RequestSummary, StoreError> {
        let requests = self.series.recent(REQUEST_METRIC, window_minutes)?;
        let errors = self.series.recent(ERROR_METRIC, window_minutes)?;
        Ok(RequestSummary::from_samples(window_minutes, &requests, &errors))
    }

    /// Prometheus text exposition of the last `window_minutes` minutes.
    pub fn render_exposition(&self, window_minutes: u32) -> Result<String, StoreError> {
        Ok(self.get_summary(window_minutes)?.to_exposition())
    }

    pub fn cleanup(&self) -> Result<usize, StoreError> {
        self.series.cleanup()
    }
}
