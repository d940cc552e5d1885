//! Periodic health checks that raise alerts.
//!
//! Each check reads host load (through the throttler's shared snapshot), the
//! recent error rate, and the circuits of the monitored dependencies. Alerts
//! go through [`AlertManager`], whose per-kind throttle keeps a sustained
//! condition from paging on every check.

use crate::application::alerts::AlertManager;
use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::metrics::MetricsCollector;
use crate::application::ports::StoreError;
use crate::application::shutdown::{ProcessorHandle, ShutdownSignal};
use crate::application::throttler::{AdaptiveThrottler, ThrottleError};
use crate::domain::alert::AlertKind;
use crate::domain::circuit::Dependency;
use crate::domain::load::LoadSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "crate::config::duration_secs")]
    pub interval: Duration,
    /// Pause after a check that failed
    #[serde(with = "crate::config::duration_secs")]
    pub error_backoff: Duration,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub error_rate_percent: f64,
    /// Window for the error rate
    pub window_minutes: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
            cpu_percent: 80.0,
            memory_percent: 85.0,
            error_rate_percent: 5.0,
            window_minutes: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("load check failed: {0}")]
    Load(#[from] ThrottleError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthCheck {
    pub load: Option<LoadSnapshot>,
    pub error_rate_percent: Option<f64>,
    pub open_circuits: Vec<Dependency>,
    /// Conditions found, whether or not the alert throttle let them through
    pub raised: Vec<AlertKind>,
}

impl HealthCheck {
    pub fn is_healthy(&self) -> bool {
        self.raised.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    alerts: Arc<AlertManager>,
    config: MonitorConfig,
    throttler: Option<AdaptiveThrottler>,
    metrics: Option<MetricsCollector>,
    breaker: Option<CircuitBreaker>,
    dependencies: Vec<Dependency>,
}

impl HealthMonitor {
    pub fn new(alerts: Arc<AlertManager>, config: MonitorConfig) -> Self {
        Self {
            alerts,
            config,
            throttler: None,
            metrics: None,
            breaker: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_throttler(mut self, throttler: AdaptiveThrottler) -> Self {
        self.throttler = Some(throttler);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Watch the circuits of `dependencies`.
    pub fn with_breaker(
        mut self,
        breaker: CircuitBreaker,
        dependencies: impl Into<Vec<Dependency>>,
    ) -> Self {
        self.breaker = Some(breaker);
        self.dependencies = dependencies.into();
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run every configured check once.
    pub fn check_once(&self) -> Result<HealthCheck, MonitorError> {
        let mut check = HealthCheck::default();

        if let Some(throttler) = &self.throttler {
            let snapshot = throttler.state()?;
            self.check_load(&snapshot, &mut check);
            check.load = Some(snapshot);
        }

        if let Some(metrics) = &self.metrics {
            let summary = metrics.get_summary(self.config.window_minutes)?;
            if summary.error_rate_percent > self.config.error_rate_percent {
                tracing::warn!(
                    error_rate = summary.error_rate_percent,
                    total_requests = summary.total_requests,
                    window_minutes = self.config.window_minutes,
                    "High error rate"
                );
                self.raise(
                    &mut check,
                    AlertKind::HighErrorRate,
                    format!(
                        "Error rate is {:.2}% over the last {} minutes",
                        summary.error_rate_percent, self.config.window_minutes
                    ),
                    json!({
                        "error_rate": summary.error_rate_percent,
                        "total_requests": summary.total_requests,
                        "total_errors": summary.total_errors,
                    }),
                );
            }
            check.error_rate_percent = Some(summary.error_rate_percent);
        }

        if let Some(breaker) = &self.breaker {
            for dependency in &self.dependencies {
                if breaker.is_open(dependency)? {
                    check.open_circuits.push(dependency.clone());
                }
            }
            if !check.open_circuits.is_empty() {
                let names: Vec<String> =
                    check.open_circuits.iter().map(|d| d.name().into_owned()).collect();
                self.raise(
                    &mut check,
                    AlertKind::CircuitOpened,
                    format!("Open circuits: {}", names.join(", ")),
                    json!({ "dependencies": names }),
                );
            }
        }

        Ok(check)
    }

    fn check_load(&self, snapshot: &LoadSnapshot, check: &mut HealthCheck) {
        let context = json!({
            "cpu": snapshot.cpu_percent,
            "memory": snapshot.memory_percent,
        });

        if snapshot.cpu_percent > self.config.cpu_percent {
            tracing::warn!(cpu = snapshot.cpu_percent, "High CPU usage");
            self.raise(
                check,
                AlertKind::HighCpuUsage,
                format!("CPU usage is {:.1}%", snapshot.cpu_percent),
                context.clone(),
            );
        }
        if snapshot.memory_percent > self.config.memory_percent {
            tracing::warn!(memory = snapshot.memory_percent, "High memory usage");
            self.raise(
                check,
                AlertKind::HighMemoryUsage,
                format!("Memory usage is {:.1}%", snapshot.memory_percent),
                context,
            );
        }
    }

    fn raise(
        &self,
        check: &mut HealthCheck,
        kind: AlertKind,
        message: String,
        context: serde_json::Value,
    ) {
        self.alerts.send_alert(kind.clone(), message, context);
        check.raised.push(kind);
    }

    /// Check every `interval` until `signal` fires.
    pub async fn run_until_shutdown(&self, mut signal: ShutdownSignal) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs_f64(),
            "Health monitor started"
        );

        while !signal.is_shutdown() {
            let pause = match self.check_once() {
                Ok(check) => {
                    tracing::debug!(healthy = check.is_healthy(), "Health check completed");
                    self.config.interval
                }
                Err(e) => {
                    tracing::error!(error = %e, "Health check failed");
                    self.config.error_backoff
                }
            };
            if signal.sleep(pause).await {
                break;
            }
        }

        tracing::info!("Health monitor stopped");
    }

    pub fn spawn(self) -> ProcessorHandle {
        ProcessorHandle::spawn("health-monitor", move |signal| async move {
            self.run_until_shutdown(signal).await;
        })
    }
}
