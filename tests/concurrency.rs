//! Limits and counters must stay exact when many threads share one store.

use loadgate::infrastructure::mocks::MockClock;
use loadgate::{
    AdmissionPipeline, AdmissionRequest, CallerIdentity, CircuitBreaker, CircuitConfig,
    CircuitState, Dependency, GuardConfig, PriorityClass, PriorityRateLimiter, ShardedStorage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_limiter_admits_exactly_capacity_across_threads() {
    let clock = MockClock::default();
    let storage = Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone())));
    let limiter = Arc::new(PriorityRateLimiter::new(storage, Arc::new(clock)));
    let allowed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let allowed = Arc::clone(&allowed);
            thread::spawn(move || {
                for _ in 0..100 {
                    let decision =
                        limiter.check_limit("user:hot", PriorityClass::Normal, 1.0).unwrap();
                    if decision.is_allowed() {
                        allowed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(allowed.load(Ordering::Relaxed), 100);
}

#[test]
fn test_concurrent_failures_are_all_counted() {
    let clock = MockClock::default();
    let storage = Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone())));
    let config = CircuitConfig {
        failure_threshold: 1_000,
        ..CircuitConfig::default()
    };
    let breaker = CircuitBreaker::with_config(storage, Arc::new(clock), config);
    let dependency = Dependency::Database;

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..50 {
                    breaker.record_failure(&dependency).unwrap();
                }
            });
        }
    });

    let record = breaker.record(&dependency).unwrap();
    assert_eq!(record.failure_count, 400);
    assert_eq!(record.state, CircuitState::Closed);
}

#[test]
fn test_circuit_opens_once_under_contention() {
    let clock = MockClock::default();
    let storage = Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone())));
    let breaker = CircuitBreaker::new(storage, Arc::new(clock.clone()));

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..10 {
                    breaker.record_failure(&Dependency::Api).unwrap();
                }
            });
        }
    });

    // Failures while Open do not extend the open window
    assert_eq!(breaker.retry_after(&Dependency::Api).unwrap(), Some(Duration::from_secs(60)));
    clock.advance(Duration::from_secs(60));
    assert_eq!(breaker.state(&Dependency::Api).unwrap(), CircuitState::HalfOpen);
}

#[test]
fn test_pipeline_shared_between_threads() {
    let clock = MockClock::default();
    let pipeline = Arc::new(
        AdmissionPipeline::builder()
            .with_config(GuardConfig::from_yaml("throttle: { enabled: false }").unwrap())
            .with_store(Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone()))))
            .with_clock(Arc::new(clock))
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                let caller = CallerIdentity::anonymous(format!("10.0.0.{i}"));
                let request = AdmissionRequest::new(caller, "/");
                (0..80).filter(|_| pipeline.admit(&request).is_ok()).count()
            })
        })
        .collect();
    let admitted: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Each address gets its own Low bucket
    assert_eq!(admitted, vec![50, 50, 50, 50]);
    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.admitted, 200);
    assert_eq!(stats.rate_limited, 120);
}
