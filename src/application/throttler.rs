//! Load-based admission throttling.
//!
//! Host load is sampled through a [`LoadProbe`] at most once per check
//! interval; the snapshot is shared through the store at `throttler:state`
//! so every worker throttles on the same reading.

use crate::application::alerts::AlertManager;
use crate::application::metrics::{MetricsCollector, THROTTLE_METRIC};
use crate::application::ports::{
    Clock, KeyValueStore, KeyValueStoreExt, LoadProbe, Mutation, ProbeError, StoreError,
};
use crate::application::timeseries::unix_secs;
use crate::domain::alert::AlertKind;
use crate::domain::load::{LoadSnapshot, Overload, ThrottleThresholds};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const STATE_KEY: &str = "throttler:state";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlerConfig {
    #[serde(flatten)]
    pub thresholds: ThrottleThresholds,
    /// How long a load snapshot is reused
    #[serde(with = "crate::config::duration_secs")]
    pub check_interval: Duration,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            thresholds: ThrottleThresholds::default(),
            check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleDecision {
    Allowed { snapshot: LoadSnapshot },
    Throttled { overload: Overload, snapshot: LoadSnapshot },
}

impl ThrottleDecision {
    pub fn is_throttled(&self) -> bool {
        matches!(self, ThrottleDecision::Throttled { .. })
    }

    pub fn snapshot(&self) -> &LoadSnapshot {
        match self {
            ThrottleDecision::Allowed { snapshot }
            | ThrottleDecision::Throttled { snapshot, .. } => snapshot,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveThrottler {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn LoadProbe>,
    config: ThrottlerConfig,
    metrics: Option<MetricsCollector>,
    alerts: Option<Arc<AlertManager>>,
}

impl AdaptiveThrottler {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn LoadProbe>,
    ) -> Self {
        Self::with_config(store, clock, probe, ThrottlerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn LoadProbe>,
        config: ThrottlerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            probe,
            config,
            metrics: None,
            alerts: None,
        }
    }

    /// Record a `throttle` sample for every throttled request.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Raise [`AlertKind::Overloaded`] when throttling.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    /// Current load snapshot, sampling the probe only when the shared one is stale.
    pub fn state(&self) -> Result<LoadSnapshot, ThrottleError> {
        let now = self.clock.now();
        let interval = chrono::Duration::from_std(self.config.check_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let probe = &self.probe;

        let sampled = self
            .store
            .update(STATE_KEY, self.config.check_interval, |cached: &mut Option<LoadSnapshot>| {
                match *cached {
                    Some(snapshot) if snapshot.sampled_at + interval > now => {
                        Mutation::Keep(Ok(snapshot))
                    }
                    _ => match probe.sample(now) {
                        Ok(snapshot) => {
                            *cached = Some(snapshot);
                            Mutation::Write(Ok(snapshot))
                        }
                        Err(e) => Mutation::Keep(Err(e)),
                    },
                }
            })?;
        Ok(sampled?)
    }

    pub fn check_throttle(&self) -> Result<ThrottleDecision, ThrottleError> {
        let snapshot = self.state()?;
        let Some(overload) = self.config.thresholds.evaluate(&snapshot) else {
            return Ok(ThrottleDecision::Allowed { snapshot });
        };

        tracing::warn!(
            resource = %overload.resource,
            value = overload.value,
            threshold = overload.threshold,
            "System overloaded, throttling request"
        );

        if let Some(metrics) = &self.metrics {
            let sample = json!({
                "type": overload.resource,
                "value": overload.value,
                "threshold": overload.threshold,
                "timestamp": unix_secs(snapshot.sampled_at),
            });
            if let Err(e) = metrics.record(THROTTLE_METRIC, sample) {
                tracing::warn!(error = %e, "Failed to record throttle sample");
            }
        }

        if let Some(alerts) = &self.alerts {
            alerts.send_alert(
                AlertKind::Overloaded,
                format!(
                    "{} usage {:.1}% above threshold {:.1}%",
                    overload.resource, overload.value, overload.threshold
                ),
                json!({
                    "cpu_percent": snapshot.cpu_percent,
                    "memory_percent": snapshot.memory_percent,
                }),
            );
        }

        Ok(ThrottleDecision::Throttled { overload, snapshot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::timeseries::TimeSeriesStore;
    use crate::domain::load::Resource;
    use crate::infrastructure::mocks::{MockCaptureLayer, MockClock, MockLoadProbe};
    use crate::infrastructure::storage::ShardedStorage;
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    struct Fixture {
        throttler: AdaptiveThrottler,
        clock: MockClock,
        probe: Arc<MockLoadProbe>,
        storage: Arc<ShardedStorage>,
    }

    fn fixture(cpu: f64, memory: f64) -> Fixture {
        let clock = MockClock::default();
        let storage = Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone())));
        let probe = Arc::new(MockLoadProbe::new(cpu, memory));
        let throttler =
            AdaptiveThrottler::new(storage.clone(), Arc::new(clock.clone()), probe.clone());
        Fixture {
            throttler,
            clock,
            probe,
            storage,
        }
    }

    #[test]
    fn test_allowed_under_thresholds() {
        let f = fixture(40.0, 50.0);
        let decision = f.throttler.check_throttle().unwrap();
        assert!(!decision.is_throttled());
        assert_eq!(decision.snapshot().cpu_percent, 40.0);
    }

    #[test]
    fn test_throttled_on_cpu() {
        let f = fixture(85.0, 50.0);
        let decision = f.throttler.check_throttle().unwrap();
        match decision {
            ThrottleDecision::Throttled { overload, .. } => {
                assert_eq!(overload.resource, Resource::Cpu);
                assert_eq!(overload.value, 85.0);
                assert_eq!(overload.threshold, 70.0);
            }
            other => panic!("expected throttling, got {:?}", other),
        }
    }

    #[test]
    fn test_throttled_on_memory() {
        let f = fixture(10.0, 92.0);
        assert!(f.throttler.check_throttle().unwrap().is_throttled());
    }

    #[test]
    fn test_snapshot_reused_within_interval() {
        let f = fixture(20.0, 20.0);
        f.throttler.check_throttle().unwrap();
        f.probe.set(95.0, 20.0);

        f.clock.advance(Duration::from_secs(4));
        assert!(!f.throttler.check_throttle().unwrap().is_throttled());
        assert_eq!(f.probe.samples(), 1);

        f.clock.advance(Duration::from_secs(1));
        assert!(f.throttler.check_throttle().unwrap().is_throttled());
        assert_eq!(f.probe.samples(), 2);
    }

    #[test]
    fn test_snapshot_shared_across_instances() {
        let f = fixture(20.0, 20.0);
        f.throttler.check_throttle().unwrap();

        let other_probe = Arc::new(MockLoadProbe::new(99.0, 99.0));
        let clock = Arc::new(f.clock.clone());
        let other = AdaptiveThrottler::new(f.storage.clone(), clock, other_probe.clone());
        assert!(!other.check_throttle().unwrap().is_throttled());
        assert_eq!(other_probe.samples(), 0);
    }

    #[test]
    fn test_probe_failure_is_an_error() {
        let f = fixture(20.0, 20.0);
        f.probe.fail();
        assert!(matches!(f.throttler.check_throttle(), Err(ThrottleError::Probe(_))));
    }

    #[test]
    fn test_throttle_is_logged_and_recorded() {
        let f = fixture(90.0, 20.0);
        let series = TimeSeriesStore::new(f.storage.clone(), Arc::new(f.clock.clone()));
        let metrics = MetricsCollector::new(series);
        let alerts = Arc::new(AlertManager::new(f.storage.clone(), Arc::new(f.clock.clone())));
        let throttler = f
            .throttler
            .clone()
            .with_metrics(metrics.clone())
            .with_alerts(alerts.clone());

        let capture = MockCaptureLayer::new();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        tracing::subscriber::with_default(subscriber, || {
            throttler.check_throttle().unwrap();
            throttler.check_throttle().unwrap();
        });

        assert!(capture.contains(Level::WARN, "System overloaded"));

        let current = metrics.current(THROTTLE_METRIC).unwrap().unwrap();
        assert_eq!(current.data["type"], "cpu");
        assert_eq!(current.data["value"], 90.0);

        // Second alert suppressed by the alert throttle
        let history = alerts.history(1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, AlertKind::Overloaded);
    }
}
