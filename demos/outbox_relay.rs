//! Relaying outbox messages to a flaky broker.
//!
//! Messages are written to an in-memory outbox, two processors race to
//! deliver them, and the broker drops every third publish. Failed messages
//! are retried on later cycles until they go through or run out of attempts.
//!
//! Run with: `cargo run --example outbox_relay`

use async_trait::async_trait;
use loadgate::{
    InMemoryOutboxStore, MessageBroker, MessageProperties, NewOutboxMessage, OutboxProcessor,
    OutboxStatus, OutboxStore, ProcessorConfig, PublishError, SystemClock,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Prints what it publishes and refuses every third message.
#[derive(Debug, Default)]
struct FlakyBroker {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), PublishError> {
        println!("   declared {name}");
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if call % 3 == 0 {
            return Err(PublishError::Unreachable("connection reset".into()));
        }
        println!(
            "   -> {queue} [{}] {}",
            properties.correlation_id,
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loadgate=info")),
        )
        .init();

    println!("=== Outbox Relay Example ===\n");

    let store = Arc::new(InMemoryOutboxStore::new());
    for order in 1..=6 {
        store
            .insert(NewOutboxMessage::json(
                "order",
                order.to_string(),
                "OrderCreated",
                &serde_json::json!({ "order_id": order, "total": order * 10 }),
            )?)
            .await?;
    }
    store
        .insert(NewOutboxMessage::json(
            "payment",
            "p-1",
            "PaymentCaptured",
            &serde_json::json!({ "amount": 60 }),
        )?)
        .await?;

    let broker = Arc::new(FlakyBroker::default());
    let config = ProcessorConfig {
        batch_size: 3,
        poll_interval: Duration::from_millis(100),
        error_backoff: Duration::from_millis(200),
        ..ProcessorConfig::default()
    };

    let handles: Vec<_> = (0..2)
        .map(|_| {
            OutboxProcessor::with_config(
                store.clone(),
                broker.clone(),
                Arc::new(SystemClock::new()),
                config.clone(),
            )
            .spawn()
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(1)).await;
    for handle in handles {
        handle.shutdown_timeout(Duration::from_secs(5)).await?;
    }

    println!("\nFinal state:");
    for (status, count) in store.count_by_status().await? {
        println!("   {status:?}: {count}");
    }
    for message in store.list(OutboxStatus::Failed, 10).await? {
        println!(
            "   #{} {} attempt {}: {}",
            message.id,
            message.event_type,
            message.attempts,
            message.error_message.unwrap_or_default()
        );
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
