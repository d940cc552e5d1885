//! Admission control for a simulated burst of traffic.
//!
//! Three callers of different priority hammer one worker, a dependency
//! starts failing and its circuit opens, and a status report is printed.
//!
//! Run with: `cargo run --example admission`
//! Set `RUST_LOG=loadgate=debug` for per-request decisions.

use loadgate::{
    AdmissionPipeline, AdmissionRequest, AlertChannel, AlertManager, AlertRecord, AlertSink,
    CallerIdentity, Dependency, GuardConfig, ShardedStorage, SinkError, StatusReporter,
    SysinfoProbe, SystemClock,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Prints chat alerts instead of posting them.
#[derive(Debug)]
struct ConsoleSink;

impl AlertSink for ConsoleSink {
    fn send(&self, alert: &AlertRecord) -> Result<(), SinkError> {
        println!("   [slack] {:?}: {}", alert.severity, alert.message);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = GuardConfig::from_env()?;
    let store = Arc::new(ShardedStorage::new());
    let clock = Arc::new(SystemClock::new());
    let alerts = Arc::new(
        AlertManager::with_config(store.clone(), clock.clone(), &config.alerts)
            .with_sink(AlertChannel::Slack, Arc::new(ConsoleSink)),
    );

    let pipeline = AdmissionPipeline::builder()
        .with_config(config)
        .with_store(store)
        .with_clock(clock)
        .with_probe(Arc::new(SysinfoProbe::new()))
        .with_alerts(alerts)
        .build()?;

    println!("=== Admission Example ===\n");
    println!("1. Burst of 300 requests per caller:");
    let callers = [
        ("premium", CallerIdentity::premium("acme")),
        ("user", CallerIdentity::user("42")),
        ("anonymous", CallerIdentity::anonymous("203.0.113.7")),
    ];
    for (label, identity) in callers {
        let request = AdmissionRequest::new(identity, "/orders");
        let mut admitted = 0;
        let mut last_rejection = None;
        for _ in 0..300 {
            match pipeline.admit(&request) {
                Ok(admission) => {
                    admitted += 1;
                    pipeline.complete(&admission, 200, Duration::from_millis(15));
                }
                Err(rejection) => last_rejection = Some(rejection),
            }
        }
        print!("   {label:<10} admitted {admitted:>3}");
        match last_rejection {
            Some(r) => println!(
                ", then {} ({}), retry after {:?}",
                r.status_code(),
                r.reason(),
                r.retry_after()
            ),
            None => println!(),
        }
    }

    println!("\n2. Upstream starts failing:");
    let request = AdmissionRequest::new(CallerIdentity::premium("ops"), "/reports");
    for attempt in 1..=7 {
        match pipeline.admit(&request) {
            Ok(admission) => {
                let started = Instant::now();
                pipeline.complete(&admission, 503, started.elapsed());
                println!("   attempt {attempt}: admitted, upstream answered 503");
            }
            Err(rejection) => println!(
                "   attempt {attempt}: rejected with {}, retry after {:?}",
                rejection.status_code(),
                rejection.retry_after()
            ),
        }
    }

    println!("\n3. Metrics exposition:\n");
    println!("{}", pipeline.metrics().render_exposition(5)?);

    println!("4. Status report:\n");
    let report = StatusReporter::new(pipeline, [Dependency::Api]).collect().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("\nHealthy: {}", report.is_healthy());

    println!("\n=== Example Complete ===");
    Ok(())
}
