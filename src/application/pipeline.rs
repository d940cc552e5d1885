//! Per-request admission: throttle, then rate limit, then circuit check.
//!
//! ```no_run
//! use loadgate::application::pipeline::{AdmissionPipeline, AdmissionRequest};
//! use loadgate::application::rate_limiter::CallerIdentity;
//! use loadgate::infrastructure::load_probe::LoadAverageProbe;
//! use loadgate::infrastructure::storage::ShardedStorage;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = AdmissionPipeline::builder()
//!     .with_store(Arc::new(ShardedStorage::new()))
//!     .with_probe(Arc::new(LoadAverageProbe::new()))
//!     .build()?;
//!
//! let request = AdmissionRequest::new(CallerIdentity::user("42"), "/orders");
//! match pipeline.admit(&request) {
//!     Ok(admission) => pipeline.complete(&admission, 200, Duration::from_millis(35)),
//!     Err(rejection) => println!("{} {}", rejection.status_code(), rejection),
//! }
//! # Ok(())
//! # }
//! ```

use crate::application::alerts::AlertManager;
use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::metrics::MetricsCollector;
use crate::application::ports::{Clock, KeyValueStore, LoadProbe, StoreError};
use crate::application::rate_limiter::{
    priority_for, CallerIdentity, LimitError, PriorityRateLimiter,
};
use crate::application::stats::PipelineStats;
use crate::application::throttler::{AdaptiveThrottler, ThrottleDecision};
use crate::application::timeseries::TimeSeriesStore;
use crate::config::{ConfigError, GuardConfig};
use crate::domain::bucket::{BucketDecision, PriorityClass, SpecError};
use crate::domain::circuit::Dependency;
use crate::domain::load::Overload;
use crate::infrastructure::clock::SystemClock;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Error returned when building an `AdmissionPipeline` fails.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a key/value store is required")]
    MissingStore,
    #[error("throttling is enabled but no load probe was provided")]
    MissingProbe,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bucket(#[from] SpecError),
}

/// One incoming request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    pub identity: CallerIdentity,
    pub endpoint: String,
    /// Client-requested priority; can only lower the granted class
    pub priority_hint: Option<PriorityClass>,
    /// Tokens this request consumes
    pub cost: f64,
}

impl AdmissionRequest {
    pub fn new(identity: CallerIdentity, endpoint: impl Into<String>) -> Self {
        Self {
            identity,
            endpoint: endpoint.into(),
            priority_hint: None,
            cost: 1.0,
        }
    }

    pub fn with_priority_hint(mut self, hint: PriorityClass) -> Self {
        self.priority_hint = Some(hint);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Permission to handle a request. Hand it back to [`AdmissionPipeline::complete`].
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub subject: String,
    pub priority: PriorityClass,
    pub endpoint: String,
    pub admitted_at: DateTime<Utc>,
    /// Tokens left in the caller's bucket, when rate limiting ran
    pub remaining_tokens: Option<f64>,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("service temporarily overloaded: {} at {:.1}%", .overload.resource, .overload.value)]
    Throttled { overload: Overload, retry_after_secs: u64 },
    #[error("rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },
    #[error("service {dependency} is temporarily unavailable")]
    CircuitOpen { dependency: Dependency, retry_after_secs: u64 },
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Throttled { .. } => "throttled",
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::CircuitOpen { .. } => "circuit_open",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Rejection::RateLimited { .. } => 429,
            Rejection::Throttled { .. } | Rejection::CircuitOpen { .. } => 503,
        }
    }

    /// Value for a `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        let secs = match self {
            Rejection::Throttled { retry_after_secs, .. }
            | Rejection::RateLimited { retry_after_secs }
            | Rejection::CircuitOpen { retry_after_secs, .. } => *retry_after_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

/// Builder for constructing an `AdmissionPipeline`.
#[derive(Debug, Default)]
pub struct AdmissionPipelineBuilder {
    config: GuardConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    probe: Option<Arc<dyn LoadProbe>>,
    alerts: Option<Arc<AlertManager>>,
}

impl AdmissionPipelineBuilder {
    pub fn with_config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared store for buckets, circuits, load snapshots, and metrics.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set a custom clock (mainly for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Required unless throttling is disabled.
    pub fn with_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use an alert manager with custom sinks instead of the log-only default.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Build the pipeline.
    ///
    /// # Errors
    /// Returns `BuildError` if the configuration is invalid or a required
    /// collaborator is missing.
    pub fn build(self) -> Result<AdmissionPipeline, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let config = self.config;

        let alerts = self.alerts.unwrap_or_else(|| {
            Arc::new(AlertManager::with_config(store.clone(), clock.clone(), &config.alerts))
        });
        let metrics = MetricsCollector::with_config(
            TimeSeriesStore::new(store.clone(), clock.clone()),
            &config.metrics,
        );

        let throttler = if config.throttle.enabled {
            let probe = self.probe.ok_or(BuildError::MissingProbe)?;
            Some(
                AdaptiveThrottler::with_config(
                    store.clone(),
                    clock.clone(),
                    probe,
                    config.throttle.throttler.clone(),
                )
                .with_metrics(metrics.clone())
                .with_alerts(alerts.clone()),
            )
        } else {
            None
        };

        let limiter = if config.rate_limit.enabled {
            Some(PriorityRateLimiter::with_config(
                store.clone(),
                clock.clone(),
                config.rate_limit.limiter.clone(),
            )?)
        } else {
            None
        };

        let thresholds = config.circuit_breaker.thresholds;
        let breaker = CircuitBreaker::with_config(store.clone(), clock.clone(), thresholds)
            .with_alerts(alerts.clone());

        Ok(AdmissionPipeline {
            throttler,
            limiter,
            breaker,
            check_circuit: config.circuit_breaker.enabled,
            dependency: config.circuit_breaker.dependency.clone(),
            metrics,
            alerts,
            stats: PipelineStats::new(),
            store,
            clock,
        })
    }
}

/// Admission checks for incoming requests.
///
/// Rejections are never reported to the circuit breaker. If the store or the
/// load probe fails, the affected check is skipped and the request proceeds.
#[derive(Debug, Clone)]
pub struct AdmissionPipeline {
    throttler: Option<AdaptiveThrottler>,
    limiter: Option<PriorityRateLimiter>,
    breaker: CircuitBreaker,
    check_circuit: bool,
    dependency: Dependency,
    metrics: MetricsCollector,
    alerts: Arc<AlertManager>,
    stats: PipelineStats,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl AdmissionPipeline {
    pub fn builder() -> AdmissionPipelineBuilder {
        AdmissionPipelineBuilder::default()
    }

    pub fn admit(&self, request: &AdmissionRequest) -> Result<Admission, Rejection> {
        if let Some(throttler) = &self.throttler {
            match throttler.check_throttle() {
                Ok(ThrottleDecision::Throttled { overload, .. }) => {
                    let retry_after_secs = throttler.config().check_interval.as_secs().max(1);
                    let rejection = Rejection::Throttled {
                        overload,
                        retry_after_secs,
                    };
                    return Err(self.reject(request, rejection));
                }
                Ok(ThrottleDecision::Allowed { .. }) => {}
                Err(e) => self.fail_open("throttle", &e),
            }
        }

        let subject = request.identity.subject();
        let priority = priority_for(&request.identity, request.priority_hint);
        let mut remaining_tokens = None;

        if let Some(limiter) = &self.limiter {
            match limiter.check_limit(&subject, priority, request.cost) {
                Ok(BucketDecision::Allowed { remaining }) => remaining_tokens = Some(remaining),
                Ok(BucketDecision::Rejected { retry_after_secs }) => {
                    return Err(self.reject(request, Rejection::RateLimited { retry_after_secs }));
                }
                Err(LimitError::Store(e @ StoreError::Contention { .. })) => {
                    // The store is reachable but too busy to take the token
                    tracing::warn!(error = %e, subject = %subject, "Rate limit bucket contended");
                    let rejection = Rejection::RateLimited { retry_after_secs: 1 };
                    return Err(self.reject(request, rejection));
                }
                Err(LimitError::Store(e)) => self.fail_open("rate_limit", &e),
                Err(e) => {
                    // Can never succeed, so retrying is pointless
                    tracing::error!(
                        error = %e,
                        subject = %subject,
                        "Request cost is not admissible"
                    );
                    let rejection = Rejection::RateLimited { retry_after_secs: 0 };
                    return Err(self.reject(request, rejection));
                }
            }
        }

        if self.check_circuit {
            match self.breaker.is_open(&self.dependency) {
                Ok(true) => {
                    let retry_after_secs = self
                        .breaker
                        .retry_after(&self.dependency)
                        .ok()
                        .flatten()
                        .map_or(1, |wait| wait.as_secs().max(1));
                    return Err(self.reject(
                        request,
                        Rejection::CircuitOpen {
                            dependency: self.dependency.clone(),
                            retry_after_secs,
                        },
                    ));
                }
                Ok(false) => {}
                Err(e) => self.fail_open("circuit_breaker", &e),
            }
        }

        self.stats.record_admitted();
        Ok(Admission {
            subject,
            priority,
            endpoint: request.endpoint.clone(),
            admitted_at: self.clock.now(),
            remaining_tokens,
        })
    }

    /// Record the outcome of an admitted request.
    ///
    /// Status codes of 500 and above count as failures of the guarded dependency.
    pub fn complete(&self, admission: &Admission, status_code: u16, duration: Duration) {
        let success = status_code < 500;
        self.stats.record_completed(success);

        if let Err(e) = self.metrics.record_request(duration, status_code, &admission.endpoint) {
            tracing::warn!(
                error = %e,
                endpoint = %admission.endpoint,
                "Failed to record request metrics"
            );
        }

        if self.check_circuit {
            let recorded = if success {
                self.breaker.record_success(&self.dependency)
            } else {
                self.breaker.record_failure(&self.dependency)
            };
            if let Err(e) = recorded {
                tracing::warn!(
                    error = %e,
                    dependency = %self.dependency,
                    "Failed to record request outcome"
                );
            }
        }
    }

    fn reject(&self, request: &AdmissionRequest, rejection: Rejection) -> Rejection {
        tracing::debug!(
            reason = rejection.reason(),
            subject = %request.identity,
            endpoint = %request.endpoint,
            "Request rejected"
        );

        match rejection {
            Rejection::Throttled { .. } => self.stats.record_throttled(),
            Rejection::RateLimited { .. } => self.stats.record_rate_limited(),
            Rejection::CircuitOpen { .. } => self.stats.record_circuit_open(),
        }

        let context = json!({
            "code": rejection.status_code(),
            "subject": request.identity.subject(),
            "endpoint": request.endpoint,
        });
        let recorded = self
            .metrics
            .record_error(rejection.reason(), &rejection.to_string(), context);
        if let Err(e) = recorded {
            tracing::warn!(error = %e, "Failed to record rejection");
        }
        rejection
    }

    fn fail_open(&self, check: &'static str, error: &dyn std::error::Error) {
        self.stats.record_failed_open();
        tracing::warn!(check, error = %error, "Admission check unavailable, allowing request");
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn throttler(&self) -> Option<&AdaptiveThrottler> {
        self.throttler.as_ref()
    }

    pub fn limiter(&self) -> Option<&PriorityRateLimiter> {
        self.limiter.as_ref()
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Dependency whose circuit gates admission.
    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    /// Store shared by every check.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::circuit::CircuitState;
    use crate::domain::load::Resource;
    use crate::infrastructure::mocks::{MockClock, MockLoadProbe};
    use crate::infrastructure::storage::ShardedStorage;

    struct Fixture {
        pipeline: AdmissionPipeline,
        clock: MockClock,
        probe: Arc<MockLoadProbe>,
    }

    fn fixture(config: GuardConfig) -> Fixture {
        let clock = MockClock::default();
        let storage = Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone())));
        let probe = Arc::new(MockLoadProbe::new(10.0, 10.0));
        let pipeline = AdmissionPipeline::builder()
            .with_config(config)
            .with_store(storage)
            .with_clock(Arc::new(clock.clone()))
            .with_probe(probe.clone())
            .build()
            .unwrap();
        Fixture { pipeline, clock, probe }
    }

    fn request() -> AdmissionRequest {
        AdmissionRequest::new(CallerIdentity::user("42"), "/orders")
    }

    #[test]
    fn test_admits_under_normal_conditions() {
        let f = fixture(GuardConfig::default());
        let admission = f.pipeline.admit(&request()).unwrap();

        assert_eq!(admission.subject, "user:42");
        assert_eq!(admission.priority, PriorityClass::Normal);
        assert_eq!(admission.remaining_tokens, Some(99.0));
        assert_eq!(admission.admitted_at, f.clock.now());
        assert_eq!(f.pipeline.stats().snapshot().admitted, 1);
    }

    #[test]
    fn test_throttle_checked_first() {
        let f = fixture(GuardConfig::default());
        f.probe.set(95.0, 10.0);

        let rejection = f.pipeline.admit(&request()).unwrap_err();
        assert!(matches!(
            rejection,
            Rejection::Throttled { overload, .. } if overload.resource == Resource::Cpu
        ));
        assert_eq!(rejection.status_code(), 503);
        assert_eq!(rejection.reason(), "throttled");
        assert_eq!(rejection.retry_after(), Some(Duration::from_secs(5)));

        // No tokens were spent on the throttled request
        let limiter = f.pipeline.limiter().unwrap();
        assert_eq!(limiter.tokens("user:42", PriorityClass::Normal).unwrap(), 100.0);
    }

    #[test]
    fn test_rate_limited() {
        let f = fixture(GuardConfig::default());
        let anonymous = AdmissionRequest::new(CallerIdentity::anonymous("10.1.1.1"), "/search");
        for _ in 0..50 {
            f.pipeline.admit(&anonymous).unwrap();
        }

        let rejection = f.pipeline.admit(&anonymous).unwrap_err();
        assert_eq!(rejection, Rejection::RateLimited { retry_after_secs: 1 });
        assert_eq!(rejection.status_code(), 429);
        assert_eq!(f.pipeline.stats().snapshot().rate_limited, 1);
        assert_eq!(f.pipeline.metrics().counter("error_type_rate_limited").unwrap(), 1);
    }

    #[test]
    fn test_priority_hint_cannot_raise_class() {
        let f = fixture(GuardConfig::default());
        let hinted = AdmissionRequest::new(CallerIdentity::anonymous("10.1.1.1"), "/")
            .with_priority_hint(PriorityClass::High);
        assert_eq!(f.pipeline.admit(&hinted).unwrap().priority, PriorityClass::Low);
    }

    #[test]
    fn test_inadmissible_cost_rejected_without_retry() {
        let f = fixture(GuardConfig::default());
        let huge = request().with_cost(1_000.0);
        let rejection = f.pipeline.admit(&huge).unwrap_err();
        assert_eq!(rejection.reason(), "rate_limited");
        assert_eq!(rejection.retry_after(), None);
    }

    #[test]
    fn test_server_errors_open_circuit() {
        let f = fixture(GuardConfig::default());
        for _ in 0..5 {
            let admission = f.pipeline.admit(&request()).unwrap();
            f.pipeline.complete(&admission, 502, Duration::from_millis(20));
        }

        let rejection = f.pipeline.admit(&request()).unwrap_err();
        assert_eq!(
            rejection,
            Rejection::CircuitOpen {
                dependency: Dependency::Api,
                retry_after_secs: 60,
            }
        );
        // Rejections are not failures; the circuit recovers on schedule
        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.pipeline.breaker().state(&Dependency::Api).unwrap(), CircuitState::HalfOpen);
        assert!(f.pipeline.admit(&request()).is_ok());
    }

    #[test]
    fn test_client_errors_do_not_trip_circuit() {
        let f = fixture(GuardConfig::default());
        for _ in 0..10 {
            let admission = f.pipeline.admit(&request()).unwrap();
            f.pipeline.complete(&admission, 404, Duration::from_millis(5));
        }
        assert!(f.pipeline.admit(&request()).is_ok());
        assert_eq!(f.pipeline.stats().snapshot().completed, 10);
        assert_eq!(f.pipeline.metrics().counter("request_status_404").unwrap(), 10);
    }

    #[test]
    fn test_disabled_checks_are_skipped() {
        let mut config = GuardConfig::default();
        config.throttle.enabled = false;
        config.rate_limit.enabled = false;
        config.circuit_breaker.enabled = false;

        let clock = MockClock::default();
        let pipeline = AdmissionPipeline::builder()
            .with_config(config)
            .with_store(Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone()))))
            .with_clock(Arc::new(clock))
            .build()
            .unwrap();

        for _ in 0..500 {
            let admission = pipeline.admit(&request()).unwrap();
            assert_eq!(admission.remaining_tokens, None);
            pipeline.complete(&admission, 500, Duration::ZERO);
        }
        assert!(pipeline.throttler().is_none());
    }

    #[test]
    fn test_probe_failure_fails_open() {
        let f = fixture(GuardConfig::default());
        f.probe.fail();
        assert!(f.pipeline.admit(&request()).is_ok());
        assert_eq!(f.pipeline.stats().snapshot().failed_open, 1);
    }

    /// Reachable store whose read-modify-writes never win.
    #[derive(Debug)]
    struct ContendedStore;

    impl KeyValueStore for ContendedStore {
        fn update_raw(
            &self,
            key: &str,
            _ttl: Option<Duration>,
            _f: &mut dyn FnMut(Option<&str>) -> crate::application::ports::RawMutation,
        ) -> Result<(), StoreError> {
            Err(StoreError::Contention {
                key: key.to_string(),
                attempts: 10,
            })
        }

        fn get_raw(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        fn set_raw(
            &self,
            _key: &str,
            _value: String,
            _ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn remove(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        fn increment(
            &self,
            _key: &str,
            by: i64,
            _ttl: Option<Duration>,
        ) -> Result<i64, StoreError> {
            Ok(by)
        }

        fn counter(&self, _key: &str) -> Result<i64, StoreError> {
            Ok(0)
        }

        fn append(
            &self,
            _key: &str,
            _score: f64,
            _member: String,
            _ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn range_by_score(
            &self,
            _key: &str,
            _min: f64,
            _max: f64,
        ) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        fn remove_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
            Ok(0)
        }

        fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_contended_bucket_rejects_instead_of_failing_open() {
        let mut config = GuardConfig::default();
        config.throttle.enabled = false;
        config.circuit_breaker.enabled = false;
        let pipeline = AdmissionPipeline::builder()
            .with_config(config)
            .with_store(Arc::new(ContendedStore))
            .with_clock(Arc::new(MockClock::default()))
            .build()
            .unwrap();

        for _ in 0..3 {
            let rejection = pipeline.admit(&request()).unwrap_err();
            assert_eq!(rejection.reason(), "rate_limited");
            assert_eq!(rejection.status_code(), 429);
            assert_eq!(rejection.retry_after(), Some(Duration::from_secs(1)));
        }
        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.rate_limited, 3);
        assert_eq!(stats.failed_open, 0);
        assert_eq!(stats.admitted, 0);
    }

    #[test]
    fn test_build_errors() {
        assert!(matches!(AdmissionPipeline::builder().build(), Err(BuildError::MissingStore)));

        let missing_probe = AdmissionPipeline::builder()
            .with_store(Arc::new(ShardedStorage::new()))
            .build();
        assert!(matches!(missing_probe, Err(BuildError::MissingProbe)));

        let mut config = GuardConfig::default();
        config.circuit_breaker.thresholds.failure_threshold = 0;
        let invalid = AdmissionPipeline::builder()
            .with_config(config)
            .with_store(Arc::new(ShardedStorage::new()))
            .build();
        assert!(matches!(invalid, Err(BuildError::Config(ConfigError::Zero(_)))));
    }
}
