//! In-memory message broker that records what it receives.

use crate::application::ports::{MessageBroker, MessageProperties, PublishError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A message the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Default)]
struct BrokerState {
    declared: Vec<String>,
    published: Vec<PublishedMessage>,
    failures: VecDeque<PublishError>,
    unreachable: bool,
}

/// Broker double with failure injection.
///
/// Queued failures are returned by `publish`, one per call, before it starts
/// accepting messages again.
#[derive(Debug, Default)]
pub struct RecordingBroker {
    state: Mutex<BrokerState>,
    delay: Option<Duration>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every publish and ping.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `count` publishes with `error`.
    pub fn fail_next(&self, count: usize, error: PublishError) {
        self.lock().failures.extend(std::iter::repeat(error).take(count));
    }

    /// Make `ping` fail until set back to false.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn declared(&self) -> Vec<String> {
        self.lock().declared.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .expect("RecordingBroker mutex poisoned - a test thread panicked holding the lock")
    }
}

#[async_trait]
impl MessageBroker for RecordingBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), PublishError> {
        let mut state = self.lock();
        if !state.declared.iter().any(|q| q == name) {
            state.declared.push(name.to_string());
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.published.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), PublishError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock().unreachable {
            return Err(PublishError::Unreachable("connection refused".into()));
        }
        Ok(())
    }
}
