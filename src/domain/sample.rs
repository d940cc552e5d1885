//! Metric samples and rolling request summaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

/// Requests slower than this many seconds bump `request_slow`.
pub const SLOW_REQUEST_SECS: f64 = 1.0;

/// One recorded observation.
///
/// `id` keeps otherwise identical samples distinct members of the sorted set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    /// Unix seconds with sub-second precision
    pub timestamp: f64,
    pub data: serde_json::Value,
}

impl MetricSample {
    fn duration(&self) -> Option<f64> {
        self.data.get("duration").and_then(serde_json::Value::as_f64)
    }

    fn status_code(&self) -> u16 {
        self.data
            .get("status_code")
            .and_then(serde_json::Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(0)
    }
}

/// Aggregate view of requests and errors over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub period_minutes: u32,
    pub total_requests: u64,
    pub total_errors: u64,
    /// Errors per hundred requests; zero when there were no requests
    pub error_rate_percent: f64,
    pub avg_duration: f64,
    pub max_duration: f64,
    pub status_codes: BTreeMap<u16, u64>,
}

impl RequestSummary {
    /// Summarize `request` and `error` samples.
    pub fn from_samples(
        period_minutes: u32,
        requests: &[MetricSample],
        errors: &[MetricSample],
    ) -> Self {
        let total_requests = requests.len() as u64;
        let total_errors = errors.len() as u64;

        let durations: Vec<f64> = requests.iter().filter_map(MetricSample::duration).collect();
        let (avg_duration, max_duration) = if durations.is_empty() {
            (0.0, 0.0)
        } else {
            let sum: f64 = durations.iter().sum();
            let max = durations.iter().copied().fold(f64::MIN, f64::max);
            (sum / durations.len() as f64, max)
        };

        let mut status_codes = BTreeMap::new();
        for request in requests {
            *status_codes.entry(request.status_code()).or_insert(0) += 1;
        }

        let error_rate_percent = if total_requests > 0 {
            total_errors as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };

        Self {
            period_minutes,
            total_requests,
            total_errors,
            error_rate_percent,
            avg_duration: round3(avg_duration),
            max_duration: round3(max_duration),
            status_codes,
        }
    }

    /// Render in the Prometheus text exposition format.
    pub fn to_exposition(&self) -> String {
        let mut out = String::new();
        let families: [(&str, &str, &str, String); 4] = [
            (
                "api_requests_total",
                "Total number of API requests",
                "counter",
                self.total_requests.to_string(),
            ),
            (
                "api_errors_total",
                "Total number of API errors",
                "counter",
                self.total_errors.to_string(),
            ),
            (
                "api_request_duration_avg",
                "Average request duration in seconds",
                "gauge",
                self.avg_duration.to_string(),
            ),
            (
                "api_request_duration_max",
                "Maximum request duration in seconds",
                "gauge",
                self.max_duration.to_string(),
            ),
        ];

        for (name, help, kind, value) in families {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
            out.push('\n');
        }

        let _ = writeln!(out, "# HELP api_requests_by_status API requests by HTTP status code");
        let _ = writeln!(out, "# TYPE api_requests_by_status counter");
        for (code, count) in &self.status_codes {
            let _ = writeln!(out, "api_requests_by_status{{code=\"{code}\"}} {count}");
        }

        out
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
