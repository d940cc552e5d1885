//! Outbox relay: drains pending messages into the broker.
//!
//! Each cycle claims a batch under a fresh claim token, publishes every
//! message to `events.<snake_case event type>`, and records the outcome.
//! A message whose claim expires (crashed worker) is claimed again by the
//! next cycle, so delivery is at-least-once; consumers deduplicate on the
//! correlation id, which is the message id.

use crate::application::alerts::AlertManager;
use crate::application::circuit_breaker::{CallError, CircuitBreaker};
use crate::application::ports::{
    Clock, MessageBroker, MessageProperties, OutboxStore, PublishError, StoreError,
};
use crate::application::shutdown::{ProcessorHandle, ShutdownSignal};
use crate::domain::alert::AlertKind;
use crate::domain::circuit::Dependency;
use crate::domain::outbox::{queue_name, OutboxMessage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Messages claimed per cycle
    pub batch_size: usize,
    /// Pause after a completed cycle
    #[serde(with = "crate::config::duration_secs")]
    pub poll_interval: Duration,
    /// Pause after a cycle that could not reach the store
    #[serde(with = "crate::config::duration_secs")]
    pub error_backoff: Duration,
    /// Upper bound on one declare + publish
    #[serde(with = "crate::config::duration_secs")]
    pub publish_timeout: Duration,
    /// How long a claim lasts before another worker may take the message
    #[serde(with = "crate::config::duration_secs")]
    pub visibility_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    /// Failed but will be retried
    pub retrying: usize,
    /// Failed on the final attempt
    pub exhausted: usize,
    /// Handed back unattempted because the broker circuit opened mid-batch
    pub released: usize,
    /// Outcome not recorded: claim lost or store error
    pub unrecorded: usize,
}

enum Outcome {
    Completed,
    Retrying,
    Exhausted,
    Unrecorded,
    CircuitOpen,
}

#[derive(Debug, Clone)]
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    alerts: Option<Arc<AlertManager>>,
    breaker: Option<CircuitBreaker>,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_config(store, broker, clock, ProcessorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            config,
            alerts: None,
            breaker: None,
        }
    }

    /// Raise [`AlertKind::OutboxMessageFailed`] for terminally failed messages.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Guard publishing with the broker circuit; cycles are skipped while it is open.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Claim and publish one batch.
    ///
    /// # Errors
    /// Only a failed claim is an error; per-message failures are recorded on
    /// the message and never abort the batch.
    pub async fn run_once(&self) -> Result<BatchReport, StoreError> {
        if let Some(breaker) = &self.breaker {
            if breaker.is_open(&Dependency::Broker).unwrap_or(false) {
                tracing::debug!("Broker circuit open, skipping outbox cycle");
                return Ok(BatchReport::default());
            }
        }

        let token = Uuid::new_v4();
        let messages = self
            .store
            .claim_batch(
                self.config.batch_size,
                token,
                self.clock.now(),
                self.config.visibility_timeout,
            )
            .await?;

        let mut report = BatchReport {
            claimed: messages.len(),
            ..BatchReport::default()
        };
        if !messages.is_empty() {
            tracing::debug!(count = messages.len(), %token, "Claimed outbox batch");
        }

        for (index, message) in messages.iter().enumerate() {
            match self.process(message, token).await {
                Outcome::Completed => report.completed += 1,
                Outcome::Retrying => report.retrying += 1,
                Outcome::Exhausted => report.exhausted += 1,
                Outcome::Unrecorded => report.unrecorded += 1,
                Outcome::CircuitOpen => {
                    let rest = &messages[index..];
                    tracing::warn!(
                        count = rest.len(),
                        "Broker circuit opened mid-batch, releasing remaining claims"
                    );
                    for message in rest {
                        if self.release(message, token).await {
                            report.released += 1;
                        } else {
                            report.unrecorded += 1;
                        }
                    }
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn release(&self, message: &OutboxMessage, token: Uuid) -> bool {
        match self.store.release(message.id, token, self.clock.now()).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(id = message.id, "Claim lost before release was recorded");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, id = message.id, "Failed to release outbox message");
                false
            }
        }
    }

    async fn process(&self, message: &OutboxMessage, token: Uuid) -> Outcome {
        match self.publish(message).await {
            Ok(()) => self.complete(message, token).await,
            Err(CallError::Open(_)) => Outcome::CircuitOpen,
            Err(CallError::Inner(error)) => self.fail(message, token, &error.to_string()).await,
        }
    }

    async fn complete(&self, message: &OutboxMessage, token: Uuid) -> Outcome {
        match self.store.mark_completed(message.id, token, self.clock.now()).await {
            Ok(true) => {
                tracing::debug!(
                    id = message.id,
                    event_type = %message.event_type,
                    "Outbox message published"
                );
                Outcome::Completed
            }
            Ok(false) => {
                tracing::warn!(id = message.id, "Claim lost before completion was recorded");
                Outcome::Unrecorded
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    id = message.id,
                    "Failed to mark outbox message completed"
                );
                Outcome::Unrecorded
            }
        }
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), CallError<PublishError>> {
        let queue = queue_name(&message.event_type);
        let properties = MessageProperties {
            correlation_id: message.id.to_string(),
            timestamp: self.clock.now(),
            message_type: message.event_type.clone(),
            content_type: "application/json",
            persistent: true,
        };
        let timeout = self.config.publish_timeout;
        let broker = &self.broker;

        let attempt = async {
            let send = async {
                broker.declare_queue(&queue).await?;
                broker.publish(&queue, &message.payload, &properties).await
            };
            tokio::time::timeout(timeout, send)
                .await
                .unwrap_or(Err(PublishError::Timeout(timeout)))
        };

        match &self.breaker {
            Some(breaker) => breaker.call_async(&Dependency::Broker, attempt).await,
            None => attempt.await.map_err(CallError::Inner),
        }
    }

    async fn fail(&self, message: &OutboxMessage, token: Uuid, error: &str) -> Outcome {
        let exhausted = !message.can_retry();
        match self.store.mark_failed(message.id, token, error, self.clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(id = message.id, "Claim lost before failure was recorded");
                return Outcome::Unrecorded;
            }
            Err(e) => {
                tracing::warn!(error = %e, id = message.id, "Failed to mark outbox message failed");
                return Outcome::Unrecorded;
            }
        }

        if !exhausted {
            tracing::warn!(
                id = message.id,
                attempt = message.attempts,
                max_attempts = message.max_attempts,
                error,
                "Outbox publish failed, will retry"
            );
            return Outcome::Retrying;
        }

        tracing::error!(
            id = message.id,
            event_type = %message.event_type,
            attempts = message.attempts,
            error,
            "Outbox message failed permanently"
        );
        if let Some(alerts) = &self.alerts {
            alerts.send_alert(
                AlertKind::OutboxMessageFailed,
                format!("Outbox message {} failed after {} attempts", message.id, message.attempts),
                json!({
                    "id": message.id,
                    "event_type": message.event_type,
                    "aggregate_type": message.aggregate_type,
                    "aggregate_id": message.aggregate_id,
                    "error": error,
                }),
            );
        }
        Outcome::Exhausted
    }

    /// Run cycles until `signal` fires. The batch in flight always finishes.
    pub async fn run_until_shutdown(&self, mut signal: ShutdownSignal) {
        tracing::info!(batch_size = self.config.batch_size, "Outbox processor started");

        while !signal.is_shutdown() {
            let pause = match self.run_once().await {
                Ok(_) => self.config.poll_interval,
                Err(e) => {
                    tracing::error!(error = %e, "Outbox processor cycle failed");
                    self.config.error_backoff
                }
            };
            if signal.sleep(pause).await {
                break;
            }
        }

        tracing::info!("Outbox processor stopped");
    }

    /// Run on a background task until the handle is shut down.
    pub fn spawn(self) -> ProcessorHandle {
        ProcessorHandle::spawn("outbox", move |signal| async move {
            self.run_until_shutdown(signal).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outbox::{NewOutboxMessage, OutboxStatus};
    use crate::infrastructure::mocks::{MockCaptureLayer, MockClock, RecordingBroker};
    use crate::infrastructure::outbox_store::InMemoryOutboxStore;
    use crate::infrastructure::storage::ShardedStorage;
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    struct Fixture {
        processor: OutboxProcessor,
        store: Arc<InMemoryOutboxStore>,
        broker: Arc<RecordingBroker>,
        clock: MockClock,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::default();
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(RecordingBroker::new());
        let processor =
            OutboxProcessor::new(store.clone(), broker.clone(), Arc::new(clock.clone()));
        Fixture {
            processor,
            store,
            broker,
            clock,
        }
    }

    async fn enqueue(store: &InMemoryOutboxStore, event_type: &str) -> u64 {
        store
            .insert(NewOutboxMessage::new("order", "42", event_type, br#"{"id":42}"#.to_vec()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publishes_pending_message() {
        let f = fixture();
        let id = enqueue(&f.store, "OrderCreated").await;

        let report = f.processor.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);

        let published = f.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].queue, "events.order_created");
        assert_eq!(published[0].payload, br#"{"id":42}"#.to_vec());
        assert_eq!(published[0].properties.correlation_id, id.to_string());
        assert!(f.broker.declared().contains(&"events.order_created".to_string()));

        let message = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Completed);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.processed_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_retries_then_fails_permanently() {
        let f = fixture();
        let id = enqueue(&f.store, "OrderPaid").await;
        f.broker.fail_next(3, PublishError::Unreachable("connection refused".into()));

        let capture = MockCaptureLayer::new();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        for attempt in 1..=3 {
            let report = f.processor.run_once().await.unwrap();
            assert_eq!(report.claimed, 1, "attempt {attempt}");
        }
        assert_eq!(f.processor.run_once().await.unwrap().claimed, 0);

        let message = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.attempts, 3);
        assert!(message.error_message.unwrap().contains("connection refused"));
        assert!(f.broker.published().is_empty());
        assert!(capture.contains(Level::ERROR, "failed permanently"));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let f = fixture();
        let id = enqueue(&f.store, "OrderPaid").await;
        f.broker.fail_next(2, PublishError::Rejected("nack".into()));

        let reports = [
            f.processor.run_once().await.unwrap(),
            f.processor.run_once().await.unwrap(),
            f.processor.run_once().await.unwrap(),
        ];
        assert_eq!(reports[0].retrying, 1);
        assert_eq!(reports[2].completed, 1);

        let message = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Completed);
        assert_eq!(message.attempts, 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let f = fixture();
        enqueue(&f.store, "First").await;
        enqueue(&f.store, "Second").await;
        enqueue(&f.store, "Third").await;
        f.broker.fail_next(1, PublishError::Unreachable("blip".into()));

        let report = f.processor.run_once().await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.completed, 2);
    }

    #[tokio::test]
    async fn test_batch_size_limits_claim() {
        let f = fixture();
        for _ in 0..15 {
            enqueue(&f.store, "OrderCreated").await;
        }

        assert_eq!(f.processor.run_once().await.unwrap().claimed, 10);
        assert_eq!(f.processor.run_once().await.unwrap().claimed, 5);
        assert_eq!(f.broker.published().len(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_is_a_failure() {
        let clock = MockClock::default();
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(RecordingBroker::new().with_delay(Duration::from_secs(30)));
        let config = ProcessorConfig {
            publish_timeout: Duration::from_secs(1),
            ..ProcessorConfig::default()
        };
        let processor =
            OutboxProcessor::with_config(store.clone(), broker, Arc::new(clock), config);
        let id = enqueue(&store, "OrderCreated").await;

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.retrying, 1);
        let message = store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Failed);
        assert!(message.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_exhausted_message_raises_alert() {
        let f = fixture();
        let storage = Arc::new(ShardedStorage::with_clock(Arc::new(f.clock.clone())));
        let alerts = Arc::new(AlertManager::new(storage, Arc::new(f.clock.clone())));
        let processor = f.processor.clone().with_alerts(alerts.clone());

        let id = f
            .store
            .insert(
                NewOutboxMessage::new("order", "1", "OrderShipped", b"{}".to_vec())
                    .with_max_attempts(1),
            )
            .await
            .unwrap();
        f.broker.fail_next(1, PublishError::Rejected("no route".into()));

        assert_eq!(processor.run_once().await.unwrap().exhausted, 1);
        let history = alerts.history(1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, AlertKind::OutboxMessageFailed);
        assert_eq!(history[0].context["id"], id);
    }

    #[tokio::test]
    async fn test_open_broker_circuit_skips_cycle() {
        let f = fixture();
        let storage = Arc::new(ShardedStorage::with_clock(Arc::new(f.clock.clone())));
        let breaker = CircuitBreaker::new(storage, Arc::new(f.clock.clone()));
        let processor = f.processor.clone().with_breaker(breaker.clone());
        enqueue(&f.store, "OrderCreated").await;

        for _ in 0..5 {
            breaker.record_failure(&Dependency::Broker).unwrap();
        }
        assert_eq!(processor.run_once().await.unwrap(), BatchReport::default());
        assert_eq!(f.store.count_by_status().await.unwrap()[&OutboxStatus::Pending], 1);

        f.clock.advance(Duration::from_secs(60));
        assert_eq!(processor.run_once().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_circuit_opening_mid_batch_releases_rest() {
        let f = fixture();
        let storage = Arc::new(ShardedStorage::with_clock(Arc::new(f.clock.clone())));
        let breaker = CircuitBreaker::new(storage, Arc::new(f.clock.clone()));
        let processor = f.processor.clone().with_breaker(breaker);
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(enqueue(&f.store, "OrderCreated").await);
        }
        f.broker.fail_next(5, PublishError::Unreachable("connection refused".into()));

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.claimed, 8);
        assert_eq!(report.retrying, 5);
        assert_eq!(report.released, 3);
        assert_eq!(report.unrecorded, 0);

        for id in &ids[5..] {
            let message = f.store.get(*id).await.unwrap().unwrap();
            assert_eq!(message.status, OutboxStatus::Pending);
            assert_eq!(message.attempts, 0);
            assert_eq!(message.error_message, None);
        }
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_processor_drains_and_stops() {
        let f = fixture();
        for _ in 0..3 {
            enqueue(&f.store, "OrderCreated").await;
        }
        let config = ProcessorConfig {
            poll_interval: Duration::from_millis(10),
            ..ProcessorConfig::default()
        };
        let processor = OutboxProcessor::with_config(
            f.store.clone(),
            f.broker.clone(),
            Arc::new(f.clock.clone()),
            config,
        );

        let handle = processor.spawn();
        for _ in 0..100 {
            if f.broker.published().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await.unwrap();

        assert_eq!(f.broker.published().len(), 3);
        assert_eq!(f.store.count_by_status().await.unwrap()[&OutboxStatus::Completed], 3);
    }
}
