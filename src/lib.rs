//! # loadgate
//!
//! Request admission control and reliable event delivery for services that run
//! as many workers behind a load balancer.
//!
//! Every incoming request passes three checks, in order:
//!
//! 1. **Adaptive throttling**: host CPU and memory are sampled at most once per
//!    check interval and shared through the store. Above the thresholds
//!    (70 % CPU, 80 % memory by default) requests are rejected with 503.
//! 2. **Priority rate limiting**: one token bucket per caller. Premium users
//!    get 200 tokens refilled at 20/s, authenticated users 100 at 10/s,
//!    anonymous callers 50 at 5/s. An empty bucket rejects with 429.
//! 3. **Circuit breaking**: after 5 consecutive failures of a dependency its
//!    circuit opens for 60 seconds, then lets probe requests through.
//!
//! All state lives in a shared [`KeyValueStore`] and every change is an atomic
//! read-modify-write, so limits hold across workers. Use
//! [`ShardedStorage`] in a single process and `RedisStorage` (feature
//! `redis-storage`) across processes.
//!
//! Alongside admission, the crate relays a **transactional outbox**: messages
//! written in the same transaction as a business change are published to a
//! broker by [`OutboxProcessor`], at least once, with bounded retries.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loadgate::{AdmissionPipeline, AdmissionRequest, CallerIdentity, GuardConfig};
//! use loadgate::{ShardedStorage, SysinfoProbe};
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! let pipeline = AdmissionPipeline::builder()
//!     .with_config(GuardConfig::from_env()?)
//!     .with_store(Arc::new(ShardedStorage::new()))
//!     .with_probe(Arc::new(SysinfoProbe::new()))
//!     .build()?;
//!
//! let request = AdmissionRequest::new(CallerIdentity::user("42"), "/orders");
//! match pipeline.admit(&request) {
//!     Ok(admission) => {
//!         let started = Instant::now();
//!         // ... handle the request ...
//!         pipeline.complete(&admission, 200, started.elapsed());
//!     }
//!     Err(rejection) => {
//!         // Respond with rejection.status_code() and Retry-After
//!         let _retry = rejection.retry_after().unwrap_or(Duration::ZERO);
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Priority
//!
//! The priority class is derived on the server from the [`CallerIdentity`].
//! A client may pass a hint, but it can only lower the class:
//!
//! ```rust
//! use loadgate::{priority_for, CallerIdentity, PriorityClass};
//!
//! let caller = CallerIdentity::user("42");
//! assert_eq!(priority_for(&caller, Some(PriorityClass::High)), PriorityClass::Normal);
//! assert_eq!(priority_for(&caller, Some(PriorityClass::Low)), PriorityClass::Low);
//! ```
//!
//! ## Fail-Open Operation
//!
//! If the store or the load probe is unavailable, the affected check is
//! skipped, the request is admitted, and a warning is logged. Rejections are
//! never reported to the circuit breaker, so shedding load cannot keep a
//! circuit open.
//!
//! ## Outbox
//!
//! ```rust,no_run
//! use loadgate::{
//!     InMemoryOutboxStore, NewOutboxMessage, OutboxProcessor, OutboxStore, SystemClock,
//! };
//! # use loadgate::application::ports::MessageBroker;
//! # use std::sync::Arc;
//! # async fn run(broker: Arc<dyn MessageBroker>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryOutboxStore::new());
//! let payload = serde_json::json!({ "total": 10 });
//! store
//!     .insert(NewOutboxMessage::json("order", "42", "OrderCreated", &payload)?)
//!     .await?;
//!
//! let handle = OutboxProcessor::new(store, broker, Arc::new(SystemClock::new())).spawn();
//! // ... on shutdown; the batch in flight finishes first
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! With the `sqlite` feature, `SqliteOutboxStore::insert_in_tx` appends a
//! message inside the caller's own transaction.
//!
//! ## Observability
//!
//! Everything is logged through `tracing` with structured fields. Request and
//! error samples are kept as day-partitioned time series by
//! [`MetricsCollector`], which renders a Prometheus text exposition.
//! [`AlertManager`] delivers throttled alerts to pluggable sinks, and
//! [`HealthMonitor`] raises them from a background loop.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

pub mod config;

// Re-export commonly used types for convenience
pub use domain::{
    alert::{AlertChannel, AlertKind, AlertRecord, AlertRule, Severity},
    bucket::{BucketDecision, BucketSpec, PriorityClass, SpecError},
    circuit::{CircuitConfig, CircuitState, Dependency},
    load::{LoadSnapshot, Resource, ThrottleThresholds},
    outbox::{queue_name, NewOutboxMessage, OutboxMessage, OutboxStatus},
    sample::{MetricSample, RequestSummary},
};

pub use application::{
    alerts::{AlertConfig, AlertManager, AlertOutcome},
    circuit_breaker::{CallError, CircuitBreaker},
    metrics::{MetricsCollector, MetricsConfig},
    monitor::{HealthCheck, HealthMonitor, MonitorConfig, MonitorError},
    outbox::{BatchReport, OutboxProcessor, ProcessorConfig},
    pipeline::{
        Admission, AdmissionPipeline, AdmissionPipelineBuilder, AdmissionRequest, BuildError,
        Rejection,
    },
    ports::{
        AlertSink, Clock, KeyValueStore, KeyValueStoreExt, LoadProbe, MessageBroker,
        MessageProperties, OutboxStore, ProbeError, PublishError, SinkError, StoreError,
    },
    rate_limiter::{
        priority_for, CallerIdentity, LimitError, PriorityRateLimiter, RateLimiterConfig,
    },
    shutdown::{ProcessorHandle, ShutdownError, ShutdownSignal},
    stats::{PipelineStats, StatsSnapshot},
    status::{StatusReport, StatusReporter, PING_TIMEOUT},
    throttler::{AdaptiveThrottler, ThrottleDecision, ThrottleError, ThrottlerConfig},
    timeseries::TimeSeriesStore,
};

pub use config::{ConfigError, GuardConfig};

pub use infrastructure::{
    clock::SystemClock,
    load_probe::{LoadAverageProbe, SysinfoProbe},
    outbox_store::InMemoryOutboxStore,
    storage::ShardedStorage,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_storage::{RedisStorage, RedisStorageConfig};

#[cfg(feature = "sqlite")]
pub use infrastructure::sqlite_outbox::SqliteOutboxStore;
