//! Point-in-time status for health endpoints and dashboards.

use crate::application::pipeline::AdmissionPipeline;
use crate::application::ports::{Clock, MessageBroker, OutboxStore, StoreError};
use crate::application::stats::StatsSnapshot;
use crate::domain::alert::AlertRecord;
use crate::domain::circuit::{CircuitState, Dependency};
use crate::domain::load::LoadSnapshot;
use crate::domain::outbox::OutboxStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Hours of alert history included in a report.
pub const ALERT_HISTORY_HOURS: u32 = 24;

/// Default bound on each dependency ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Snapshot of the admission layer and the outbox.
///
/// A section that could not be read is left empty and named in `unavailable`,
/// so a report can always be produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub load: Option<LoadSnapshot>,
    /// Keyed by dependency name
    pub circuits: BTreeMap<String, CircuitState>,
    pub stats: StatsSnapshot,
    pub outbox: Option<BTreeMap<OutboxStatus, u64>>,
    pub alerts: Vec<AlertRecord>,
    pub unavailable: Vec<&'static str>,
    /// Whether `store`, `broker` and `outbox` answered a ping in time.
    /// Only dependencies the reporter was given appear.
    pub dependencies: BTreeMap<&'static str, bool>,
}

impl StatusReport {
    /// No open circuit, every section readable and every dependency alive.
    pub fn is_healthy(&self) -> bool {
        self.unavailable.is_empty()
            && self.circuits.values().all(|s| *s != CircuitState::Open)
            && self.dependencies.values().all(|alive| *alive)
    }
}

/// Collects [`StatusReport`]s from a pipeline and, optionally, the outbox
/// store and the broker.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    pipeline: AdmissionPipeline,
    circuits: Vec<Dependency>,
    outbox: Option<Arc<dyn OutboxStore>>,
    broker: Option<Arc<dyn MessageBroker>>,
    ping_timeout: Duration,
}

impl StatusReporter {
    /// Report on the pipeline's store and on the circuits of `dependencies`.
    pub fn new(pipeline: AdmissionPipeline, dependencies: impl Into<Vec<Dependency>>) -> Self {
        Self {
            pipeline,
            circuits: dependencies.into(),
            outbox: None,
            broker: None,
            ping_timeout: PING_TIMEOUT,
        }
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Bound on each dependency ping; a slower answer counts as down.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub async fn collect(&self) -> StatusReport {
        let mut unavailable = Vec::new();
        let dependencies = self.ping_dependencies().await;

        let load = match self.pipeline.throttler().map(|t| t.state()) {
            Some(Ok(snapshot)) => Some(snapshot),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Status report: load unavailable");
                unavailable.push("load");
                None
            }
            None => None,
        };

        let breaker = self.pipeline.breaker();
        let mut circuits = BTreeMap::new();
        for dependency in &self.circuits {
            match breaker.state(dependency) {
                Ok(state) => {
                    circuits.insert(dependency.name().into_owned(), state);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        dependency = %dependency,
                        "Status report: circuit unavailable"
                    );
                    if !unavailable.contains(&"circuits") {
                        unavailable.push("circuits");
                    }
                }
            }
        }

        let outbox = match &self.outbox {
            Some(store) => match store.count_by_status().await {
                Ok(counts) => Some(counts),
                Err(e) => {
                    tracing::warn!(error = %e, "Status report: outbox unavailable");
                    unavailable.push("outbox");
                    None
                }
            },
            None => None,
        };

        let alerts = self.pipeline.alerts().history(ALERT_HISTORY_HOURS).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Status report: alert history unavailable");
            unavailable.push("alerts");
            Vec::new()
        });

        StatusReport {
            generated_at: self.pipeline.clock().now(),
            load,
            circuits,
            stats: self.pipeline.stats().snapshot(),
            outbox,
            alerts,
            unavailable,
            dependencies,
        }
    }

    /// Ping every known dependency concurrently.
    async fn ping_dependencies(&self) -> BTreeMap<&'static str, bool> {
        let store = Arc::clone(self.pipeline.store());
        let store_ping = async move {
            match tokio::task::spawn_blocking(move || store.ping()).await {
                Ok(result) => result,
                Err(e) => Err(StoreError::Backend(format!("ping task failed: {e}"))),
            }
        };

        let broker = async {
            match &self.broker {
                Some(broker) => Some(self.ping("broker", broker.ping()).await),
                None => None,
            }
        };
        let outbox = async {
            match &self.outbox {
                Some(outbox) => Some(self.ping("outbox", outbox.ping()).await),
                None => None,
            }
        };
        let (store, broker, outbox) = tokio::join!(self.ping("store", store_ping), broker, outbox);

        let mut alive = BTreeMap::from([("store", store)]);
        if let Some(broker) = broker {
            alive.insert("broker", broker);
        }
        if let Some(outbox) = outbox {
            alive.insert("outbox", outbox);
        }
        alive
    }

    async fn ping<E: Display>(
        &self,
        name: &'static str,
        ping: impl Future<Output = Result<(), E>>,
    ) -> bool {
        match tokio::time::timeout(self.ping_timeout, ping).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(
                    dependency = name,
                    error = %e,
                    "Status report: dependency ping failed"
                );
                false
            }
            Err(_) => {
                tracing::warn!(
                    dependency = name,
                    timeout = ?self.ping_timeout,
                    "Status report: dependency ping timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pipeline::AdmissionRequest;
    use crate::application::rate_limiter::CallerIdentity;
    use crate::config::GuardConfig;
    use crate::domain::outbox::NewOutboxMessage;
    use crate::infrastructure::mocks::{MockClock, MockLoadProbe, RecordingBroker};
    use crate::infrastructure::outbox_store::InMemoryOutboxStore;
    use crate::infrastructure::storage::ShardedStorage;
    use std::time::Duration;

    fn pipeline(clock: &MockClock, probe: Arc<MockLoadProbe>) -> AdmissionPipeline {
        AdmissionPipeline::builder()
            .with_config(GuardConfig::default())
            .with_store(Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone()))))
            .with_clock(Arc::new(clock.clone()))
            .with_probe(probe)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_report_sections() {
        let clock = MockClock::default();
        let probe = Arc::new(MockLoadProbe::new(30.0, 40.0));
        let pipeline = pipeline(&clock, probe);
        let outbox = Arc::new(InMemoryOutboxStore::new());
        outbox
            .insert(NewOutboxMessage::new("order", "1", "OrderCreated", b"{}".to_vec()))
            .await
            .unwrap();

        let request = AdmissionRequest::new(CallerIdentity::user("7"), "/orders");
        let admission = pipeline.admit(&request).unwrap();
        pipeline.complete(&admission, 200, Duration::from_millis(15));

        let reporter = StatusReporter::new(pipeline, vec![Dependency::Api, Dependency::Database])
            .with_outbox(outbox);
        let report = reporter.collect().await;

        assert!(report.is_healthy());
        assert_eq!(report.generated_at, clock.now());
        assert_eq!(report.load.map(|l| l.memory_percent), Some(40.0));
        assert_eq!(report.circuits["api"], CircuitState::Closed);
        assert_eq!(report.circuits["database"], CircuitState::Closed);
        assert_eq!(report.stats.admitted, 1);
        assert_eq!(report.outbox.as_ref().unwrap()[&OutboxStatus::Pending], 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outbox"]["pending"], 1);
        assert_eq!(json["circuits"]["api"], "closed");
        assert_eq!(json["dependencies"]["store"], true);
        assert_eq!(json["dependencies"]["outbox"], true);
        assert!(json["dependencies"].get("broker").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_unhealthy() {
        let clock = MockClock::default();
        let pipeline = pipeline(&clock, Arc::new(MockLoadProbe::new(10.0, 10.0)));
        let broker = Arc::new(RecordingBroker::new());
        let reporter =
            StatusReporter::new(pipeline, vec![Dependency::Broker]).with_broker(broker.clone());

        assert!(reporter.collect().await.is_healthy());

        broker.set_unreachable(true);
        let report = reporter.collect().await;
        assert_eq!(report.dependencies["broker"], false);
        assert_eq!(report.dependencies["store"], true);
        assert!(report.unavailable.is_empty());
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn test_slow_dependency_times_out() {
        let clock = MockClock::default();
        let pipeline = pipeline(&clock, Arc::new(MockLoadProbe::new(10.0, 10.0)));
        let broker = Arc::new(RecordingBroker::new().with_delay(Duration::from_secs(5)));
        let reporter = StatusReporter::new(pipeline, Vec::new())
            .with_broker(broker)
            .with_ping_timeout(Duration::from_millis(50));

        let report = reporter.collect().await;
        assert_eq!(report.dependencies["broker"], false);
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn test_open_circuit_and_alert_in_report() {
        let clock = MockClock::default();
        let pipeline = pipeline(&clock, Arc::new(MockLoadProbe::new(10.0, 10.0)));
        for _ in 0..5 {
            pipeline.breaker().record_failure(&Dependency::Database).unwrap();
        }

        let report = StatusReporter::new(pipeline, vec![Dependency::Database]).collect().await;
        assert!(!report.is_healthy());
        assert_eq!(report.circuits["database"], CircuitState::Open);
        assert_eq!(report.alerts.len(), 1);
        assert!(report.outbox.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_load_is_reported() {
        let clock = MockClock::default();
        let probe = Arc::new(MockLoadProbe::new(10.0, 10.0));
        probe.fail();

        let report = StatusReporter::new(pipeline(&clock, probe), Vec::new()).collect().await;
        assert_eq!(report.unavailable, vec!["load"]);
        assert!(report.load.is_none());
        assert!(!report.is_healthy());
    }
}
